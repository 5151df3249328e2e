//! Server-side TLS termination primitives for keel backed by OpenSSL.
//!
//! This crate owns the two native-handle wrappers the termination engine is
//! built on: the process-wide [`TlsServerContext`] shared by every worker,
//! and the per-connection [`ServerSession`] state machine that advances a
//! non-blocking handshake and encrypted I/O one step at a time.
#![deny(rust_2018_idioms, unreachable_pub, missing_debug_implementations)]

mod ctx;
mod error;
mod session;

pub use self::ctx::TlsServerContext;
pub use self::error::{ContextError, SessionError};
pub use self::session::{HandshakeStep, IoStep, ServerSession, SessionInfo};
