use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::{fmt, num::NonZeroUsize};

use keel_tls::TlsServerContext;

use crate::task::{HandshakeOutcome, HandshakeReply, HandshakeTask};
use crate::wrk::{Worker, WorkerCommand, WorkerConfig};
use crate::WorkerId;

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_HANDSHAKES: usize = 256;

#[derive(Debug, Copy, Clone)]
/// Worker pool builder
pub struct PoolBuilder {
    num: usize,
    handshake_timeout: Duration,
    shutdown_timeout: Duration,
    max_handshakes: usize,
    affinity: bool,
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolBuilder {
    /// Create new pool builder instance
    pub fn new() -> Self {
        PoolBuilder {
            num: std::thread::available_parallelism().map_or(2, NonZeroUsize::get),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            max_handshakes: DEFAULT_MAX_HANDSHAKES,
            affinity: false,
        }
    }

    /// Set number of workers to start.
    ///
    /// By default the pool uses the number of available logical cpus as
    /// workers count.
    pub fn workers(mut self, num: usize) -> Self {
        self.num = num.max(1);
        self
    }

    /// Per-connection handshake deadline.
    ///
    /// A handshake that has not completed within this window resolves with
    /// `Timeout`. By default the deadline is set to 5 seconds.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Timeout for graceful workers shutdown.
    ///
    /// After `shutdown` is called workers have this much time to finish
    /// in-flight handshakes and i/o. Sessions still alive after the timeout
    /// are force closed.
    ///
    /// By default shutdown timeout sets to 30 seconds.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Per-worker cap on concurrently progressing handshakes.
    ///
    /// Submissions beyond the cap queue on the worker and are admitted as
    /// slots free up. It can be used to limit the tls cpu usage. By default
    /// max handshakes is set to a 256.
    pub fn max_handshakes(mut self, num: usize) -> Self {
        self.max_handshakes = num.max(1);
        self
    }

    /// Enable core affinity
    ///
    /// By default affinity is disabled.
    pub fn enable_affinity(mut self) -> Self {
        self.affinity = true;
        self
    }

    /// Start the workers and return the pool handle.
    pub fn run(self, ctx: TlsServerContext) -> WorkerPool {
        log::info!("Starting {} tls workers", self.num);

        let ctx = Arc::new(ctx);
        let cfg = WorkerConfig {
            handshake_timeout: self.handshake_timeout,
            max_handshakes: self.max_handshakes,
        };
        let cores = if self.affinity {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let workers = (0..self.num)
            .map(|idx| Worker::start(WorkerId(idx), ctx.clone(), cfg, cores.get(idx).copied()))
            .collect();

        WorkerPool {
            ctx,
            workers: Mutex::new(workers),
            next: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}

/// Fixed pool of tls termination workers.
///
/// Sockets handed to [`WorkerPool::submit`] are assigned round-robin; the
/// assigned worker owns the socket and its tls session for the whole
/// connection lifetime.
pub struct WorkerPool {
    ctx: Arc<TlsServerContext>,
    workers: Mutex<Vec<Worker>>,
    next: AtomicUsize,
    closed: AtomicBool,
    shutdown_timeout: Duration,
}

impl WorkerPool {
    /// Start a pool with default configuration.
    pub fn new(ctx: TlsServerContext) -> WorkerPool {
        PoolBuilder::new().run(ctx)
    }

    /// Pool builder with default values.
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// Shared server context.
    pub fn context(&self) -> &TlsServerContext {
        &self.ctx
    }

    /// Check if the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Hand an accepted client socket to a worker for tls termination.
    ///
    /// Ownership of the socket transfers to the assigned worker; the caller
    /// must not touch it afterwards. Once the pool is closed the reply
    /// resolves immediately with `WorkerPoolClosed` and the socket is
    /// dropped without any i/o.
    pub fn submit(&self, sock: TcpStream) -> HandshakeReply {
        let (tx, rx) = oneshot::channel();
        let reply = HandshakeReply(rx);

        if self.is_closed() {
            let _ = tx.send(HandshakeOutcome::WorkerPoolClosed);
            return reply;
        }

        let mut task = HandshakeTask { sock, tx };
        let mut workers = self.workers.lock().unwrap();
        loop {
            if workers.is_empty() {
                log::error!("No workers");
                task.resolve(HandshakeOutcome::WorkerPoolClosed);
                break;
            }
            let idx = self.next.fetch_add(1, Ordering::Relaxed) % workers.len();
            match workers[idx].notify.send(WorkerCommand::Handshake(task)) {
                Ok(()) => break,
                Err(WorkerCommand::Handshake(returned)) => {
                    // worker is gone, retry on the next one
                    log::trace!("Worker failed while processing item");
                    task = returned;
                    workers.remove(idx);
                }
                Err(_) => break,
            }
        }
        reply
    }

    /// Graceful shutdown.
    ///
    /// New submissions fast-fail with `WorkerPoolClosed` from this point.
    /// Every worker gets the configured drain window to finish in-flight
    /// handshakes and i/o; whatever is still open afterwards is force
    /// closed and its outstanding tasks resolve with the shutdown outcome.
    /// Blocks until all workers have stopped. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Shutting down tls worker pool");

        let mut workers = self.workers.lock().unwrap();
        let acks: Vec<oneshot::Receiver<()>> = workers
            .iter()
            .map(|wrk| {
                let (tx, rx) = oneshot::channel();
                let _ = wrk.notify.send(WorkerCommand::Stop {
                    drain: self.shutdown_timeout,
                    ack: tx,
                });
                rx
            })
            .collect();
        for ack in acks {
            let _ = ack.recv();
        }
        for wrk in workers.iter_mut() {
            if let Some(handle) = wrk.thread.take() {
                if handle.join().is_err() {
                    log::error!("{:?} terminated with panic", wrk.id);
                }
            }
        }
        workers.clear();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // dropped without explicit shutdown: terminate without drain
        let workers = self.workers.get_mut().unwrap();
        for wrk in workers.iter() {
            let _ = wrk.notify.send(WorkerCommand::Terminate);
        }
        for wrk in workers.iter_mut() {
            if let Some(handle) = wrk.thread.take() {
                if handle.join().is_err() {
                    log::error!("{:?} terminated with panic", wrk.id);
                }
            }
        }
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("ctx", &self.ctx)
            .field("closed", &self.is_closed())
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}
