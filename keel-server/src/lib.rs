//! TLS termination worker pool for keel.
//!
//! A [`WorkerPool`] owns a fixed set of worker threads, each running a
//! private non-blocking readiness loop. The accepting layer hands raw
//! client sockets to [`WorkerPool::submit`]; the assigned worker drives the
//! TLS handshake and, once established, services encrypted reads and writes
//! submitted through the returned [`TlsConnection`] handle. A session never
//! leaves the worker it was assigned to, which is what makes the native
//! library calls safe without per-call locking.
#![deny(rust_2018_idioms, unreachable_pub, missing_debug_implementations)]

mod pool;
mod task;
mod wrk;

pub use self::pool::{PoolBuilder, WorkerPool};
pub use self::task::{
    HandshakeOutcome, HandshakeReply, IoError, ReadReply, TlsConnection, WriteReply,
};

/// Worker id
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub(crate) usize);
