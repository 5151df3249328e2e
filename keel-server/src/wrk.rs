use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};
use std::{cmp, io, mem, thread};

use polling::{Event, Events, Poller};
use slab::Slab;

use keel_tls::{HandshakeStep, IoStep, ServerSession, SessionError, TlsServerContext};

use crate::task::{HandshakeOutcome, HandshakeTask, IoError, TlsConnection};
use crate::WorkerId;

/// Upper bound for a single readiness wait; this is also the resolution of
/// the handshake timeout check.
const TICK: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkerConfig {
    pub(crate) handshake_timeout: Duration,
    pub(crate) max_handshakes: usize,
}

pub(crate) enum WorkerCommand {
    Handshake(HandshakeTask),
    Io {
        key: usize,
        gen: u64,
        task: IoTask,
    },
    Close {
        key: usize,
        gen: u64,
    },
    Stop {
        drain: Duration,
        ack: oneshot::Sender<()>,
    },
    Terminate,
}

pub(crate) enum IoTask {
    Read {
        buf: Vec<u8>,
        tx: oneshot::Sender<Result<(Vec<u8>, usize), IoError>>,
    },
    Write {
        buf: Vec<u8>,
        written: usize,
        tx: oneshot::Sender<Result<usize, IoError>>,
    },
}

impl IoTask {
    fn resolve_err(self, err: IoError) {
        match self {
            IoTask::Read { tx, .. } => {
                let _ = tx.send(Err(err));
            }
            IoTask::Write { tx, .. } => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

/// Submission endpoint of one worker: the command queue plus the poller
/// handle used to wake the worker out of its readiness wait.
#[derive(Clone)]
pub(crate) struct WorkerNotify(Arc<Poller>, mpsc::Sender<WorkerCommand>);

impl WorkerNotify {
    pub(crate) fn send(&self, cmd: WorkerCommand) -> Result<(), WorkerCommand> {
        match self.1.send(cmd) {
            Ok(()) => {
                let _ = self.0.notify();
                Ok(())
            }
            Err(mpsc::SendError(cmd)) => Err(cmd),
        }
    }
}

/// Pool-side handle to a running worker thread.
pub(crate) struct Worker {
    pub(crate) id: WorkerId,
    pub(crate) notify: WorkerNotify,
    pub(crate) thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    /// Spawn the worker thread with its private poller.
    pub(crate) fn start(
        id: WorkerId,
        ctx: Arc<TlsServerContext>,
        cfg: WorkerConfig,
        cid: Option<core_affinity::CoreId>,
    ) -> Worker {
        let poller = Arc::new(
            Poller::new()
                .map_err(|e| panic!("Cannot create poller: {}", e))
                .unwrap(),
        );

        let (tx, rx) = mpsc::channel();
        let notify = WorkerNotify(poller.clone(), tx);

        let wrk_notify = notify.clone();
        let thread = thread::Builder::new()
            .name(format!("keel-server worker {}", id.0))
            .spawn(move || {
                if let Some(cid) = cid {
                    if core_affinity::set_for_current(cid) {
                        log::info!("Set affinity to {:?} for {:?}", cid, id);
                    }
                }
                TlsWorker::new(id, ctx, poller, rx, wrk_notify, cfg).run();
            })
            .expect("Cannot spawn tls worker thread");

        Worker {
            id,
            notify,
            thread: Some(thread),
        }
    }
}

enum Want {
    Read,
    Write,
}

enum ConnState {
    Handshaking {
        tx: oneshot::Sender<HandshakeOutcome>,
        deadline: Instant,
        want: Want,
    },
    Established {
        read: Option<PendingRead>,
        write: Option<PendingWrite>,
    },
}

struct PendingRead {
    buf: Vec<u8>,
    want: Want,
    tx: oneshot::Sender<Result<(Vec<u8>, usize), IoError>>,
}

struct PendingWrite {
    buf: Vec<u8>,
    written: usize,
    want: Want,
    tx: oneshot::Sender<Result<usize, IoError>>,
}

struct Connection {
    gen: u64,
    session: ServerSession,
    state: ConnState,
}

enum CloseReason {
    /// Fatal handshake error.
    Error(SessionError),
    /// Handshake deadline exceeded.
    Timeout,
    /// Close requested by the connection owner.
    Closed,
    /// Pool shutdown force-close.
    Shutdown,
}

struct Stopping {
    deadline: Instant,
    ack: Option<oneshot::Sender<()>>,
}

/// Single tls worker: a private poller, a slab of connections keyed by the
/// poller event key, and the cross-thread command queue. Every native tls
/// call for a session happens on this thread only.
struct TlsWorker {
    id: WorkerId,
    ctx: Arc<TlsServerContext>,
    poller: Arc<Poller>,
    rx: mpsc::Receiver<WorkerCommand>,
    notify: WorkerNotify,
    cfg: WorkerConfig,
    conns: Slab<Connection>,
    backlog: VecDeque<HandshakeTask>,
    handshakes: usize,
    next_gen: u64,
    stopping: Option<Stopping>,
}

impl TlsWorker {
    fn new(
        id: WorkerId,
        ctx: Arc<TlsServerContext>,
        poller: Arc<Poller>,
        rx: mpsc::Receiver<WorkerCommand>,
        notify: WorkerNotify,
        cfg: WorkerConfig,
    ) -> TlsWorker {
        TlsWorker {
            id,
            ctx,
            poller,
            rx,
            notify,
            cfg,
            conns: Slab::new(),
            backlog: VecDeque::new(),
            handshakes: 0,
            next_gen: 0,
            stopping: None,
        }
    }

    fn run(mut self) {
        log::info!("Starting {:?}", self.id);

        let mut events = Events::with_capacity(NonZeroUsize::new(256).unwrap());

        loop {
            events.clear();
            if let Err(e) = self.poller.wait(&mut events, Some(self.next_timeout())) {
                if e.kind() != io::ErrorKind::Interrupted {
                    panic!("Cannot wait for events in poller: {}", e);
                }
            }

            for ev in events.iter() {
                self.process_ready(ev.key);
            }

            self.process_commands();
            self.process_timeouts();
            self.admit_backlog();

            if self.drain_completed() {
                break;
            }
        }

        log::info!("{:?} has been stopped", self.id);
    }

    /// Next bounded wait: the base tick, shortened to the nearest handshake
    /// or drain deadline so timeouts fire on time.
    fn next_timeout(&self) -> Duration {
        let now = Instant::now();
        let mut timeout = TICK;
        for (_, conn) in self.conns.iter() {
            if let ConnState::Handshaking { deadline, .. } = &conn.state {
                timeout = cmp::min(timeout, deadline.saturating_duration_since(now));
            }
        }
        if let Some(stop) = &self.stopping {
            timeout = cmp::min(timeout, stop.deadline.saturating_duration_since(now));
        }
        timeout
    }

    fn process_commands(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(WorkerCommand::Handshake(task)) => self.submit_handshake(task),
                Ok(WorkerCommand::Io { key, gen, task }) => self.submit_io(key, gen, task),
                Ok(WorkerCommand::Close { key, gen }) => {
                    if self.conns.get(key).map_or(false, |conn| conn.gen == gen) {
                        self.close_conn(key, CloseReason::Closed);
                    }
                }
                Ok(WorkerCommand::Stop { drain, ack }) => {
                    log::info!("Stopping {:?}", self.id);
                    self.reject_backlog();
                    self.stopping = Some(Stopping {
                        deadline: Instant::now() + drain,
                        ack: Some(ack),
                    });
                }
                Ok(WorkerCommand::Terminate) => {
                    self.reject_backlog();
                    self.stopping = Some(Stopping {
                        deadline: Instant::now(),
                        ack: None,
                    });
                }
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => {
                    // pool dropped without shutdown
                    if self.stopping.is_none() {
                        log::trace!("Dropping {:?}", self.id);
                        self.reject_backlog();
                        self.stopping = Some(Stopping {
                            deadline: Instant::now(),
                            ack: None,
                        });
                    }
                    break;
                }
            }
        }
    }

    fn submit_handshake(&mut self, task: HandshakeTask) {
        if self.stopping.is_some() {
            task.resolve(HandshakeOutcome::WorkerPoolClosed);
        } else if self.handshakes >= self.cfg.max_handshakes {
            self.backlog.push_back(task);
        } else {
            self.start_handshake(task);
        }
    }

    fn start_handshake(&mut self, task: HandshakeTask) {
        let HandshakeTask { sock, tx } = task;
        let session = match ServerSession::new(&self.ctx, sock) {
            Ok(session) => session,
            Err(e) => {
                log::trace!("Cannot create tls session: {}", e);
                let _ = tx.send(HandshakeOutcome::ConnectionCreationFailed(e));
                return;
            }
        };

        let gen = self.next_gen;
        self.next_gen += 1;

        let entry = self.conns.vacant_entry();
        let key = entry.key();
        // the client hello may be readable already; ask for both directions
        // and let the first handshake step narrow the interest
        if let Err(e) = unsafe { self.poller.add(session.socket(), Event::all(key)) } {
            log::error!("Cannot register client socket: {}", e);
            let _ = tx.send(HandshakeOutcome::ConnectionCreationFailed(
                SessionError::Socket(e),
            ));
            return;
        }

        entry.insert(Connection {
            gen,
            session,
            state: ConnState::Handshaking {
                tx,
                deadline: Instant::now() + self.cfg.handshake_timeout,
                want: Want::Read,
            },
        });
        self.handshakes += 1;
        self.drive_handshake(key);
    }

    fn submit_io(&mut self, key: usize, gen: u64, task: IoTask) {
        let conn = match self.conns.get_mut(key) {
            Some(conn) if conn.gen == gen => conn,
            _ => {
                task.resolve_err(IoError::Closed);
                return;
            }
        };
        let ConnState::Established { read, write } = &mut conn.state else {
            task.resolve_err(IoError::Closed);
            return;
        };

        match task {
            IoTask::Read { buf, tx } => {
                if read.is_some() {
                    let _ = tx.send(Err(IoError::Overlapped));
                    return;
                }
                *read = Some(PendingRead {
                    buf,
                    want: Want::Read,
                    tx,
                });
                // bytes may already sit decrypted in the native buffer
                self.drive_read(key);
            }
            IoTask::Write { buf, written, tx } => {
                if write.is_some() {
                    let _ = tx.send(Err(IoError::Overlapped));
                    return;
                }
                *write = Some(PendingWrite {
                    buf,
                    written,
                    want: Want::Write,
                    tx,
                });
                self.drive_write(key);
            }
        }
    }

    fn process_ready(&mut self, key: usize) {
        let handshaking = match self.conns.get(key) {
            Some(conn) => matches!(conn.state, ConnState::Handshaking { .. }),
            None => return,
        };
        if handshaking {
            self.drive_handshake(key);
        } else {
            self.drive_read(key);
            self.drive_write(key);
        }
    }

    fn drive_handshake(&mut self, key: usize) {
        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };
        match conn.session.handshake_step() {
            Ok(HandshakeStep::Done) => {
                let info = conn.session.info();
                log::trace!("Tls handshake completed: {}", info.version);
                let gen = conn.gen;
                let state = mem::replace(
                    &mut conn.state,
                    ConnState::Established {
                        read: None,
                        write: None,
                    },
                );
                self.handshakes -= 1;
                self.arm(key);
                if let ConnState::Handshaking { tx, .. } = state {
                    let handle = TlsConnection::new(key, gen, info, self.notify.clone());
                    let _ = tx.send(HandshakeOutcome::Success(handle));
                }
            }
            Ok(HandshakeStep::WantRead) => {
                if let ConnState::Handshaking { want, .. } = &mut conn.state {
                    *want = Want::Read;
                }
                self.arm(key);
            }
            Ok(HandshakeStep::WantWrite) => {
                if let ConnState::Handshaking { want, .. } = &mut conn.state {
                    *want = Want::Write;
                }
                self.arm(key);
            }
            Err(e) => {
                log::trace!("Tls handshake failed: {}", e);
                self.close_conn(key, CloseReason::Error(e));
            }
        }
    }

    fn drive_read(&mut self, key: usize) {
        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };
        let ConnState::Established { read, .. } = &mut conn.state else {
            return;
        };
        let Some(mut pending) = read.take() else {
            return;
        };

        match conn.session.read_step(&mut pending.buf) {
            Ok(IoStep::Done(n)) => {
                let _ = pending.tx.send(Ok((pending.buf, n)));
            }
            Ok(IoStep::Eof) => {
                let _ = pending.tx.send(Ok((pending.buf, 0)));
            }
            Ok(IoStep::WantRead) => {
                pending.want = Want::Read;
                *read = Some(pending);
            }
            Ok(IoStep::WantWrite) => {
                pending.want = Want::Write;
                *read = Some(pending);
            }
            Err(e) => {
                log::trace!("Tls read failed: {}", e);
                let _ = pending.tx.send(Err(IoError::Session(e)));
                self.close_conn(key, CloseReason::Closed);
                return;
            }
        }
        self.arm(key);
    }

    fn drive_write(&mut self, key: usize) {
        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };
        let ConnState::Established { write, .. } = &mut conn.state else {
            return;
        };
        let Some(mut pending) = write.take() else {
            return;
        };

        loop {
            let remaining = &pending.buf[pending.written..];
            match conn.session.write_step(remaining) {
                Ok(IoStep::Done(n)) if n > 0 => {
                    pending.written += n;
                    if pending.written == pending.buf.len() {
                        let _ = pending.tx.send(Ok(pending.written));
                        break;
                    }
                    // short write, push the rest now
                }
                Ok(IoStep::Done(_)) | Ok(IoStep::WantWrite) => {
                    pending.want = Want::Write;
                    *write = Some(pending);
                    break;
                }
                Ok(IoStep::WantRead) => {
                    pending.want = Want::Read;
                    *write = Some(pending);
                    break;
                }
                Ok(IoStep::Eof) => {
                    let _ = pending.tx.send(Err(IoError::Closed));
                    break;
                }
                Err(e) => {
                    log::trace!("Tls write failed: {}", e);
                    let _ = pending.tx.send(Err(IoError::Session(e)));
                    self.close_conn(key, CloseReason::Closed);
                    return;
                }
            }
        }
        self.arm(key);
    }

    /// Re-arm readiness interest for the connection from its pending work.
    /// The poller delivers events in oneshot mode, so this runs after every
    /// step instead of looping on the native call.
    fn arm(&mut self, key: usize) {
        let Some(conn) = self.conns.get(key) else {
            return;
        };
        let ev = match &conn.state {
            ConnState::Handshaking { want, .. } => match want {
                Want::Read => Event::readable(key),
                Want::Write => Event::writable(key),
            },
            ConnState::Established { read, write } => {
                let mut readable = false;
                let mut writable = false;
                if let Some(read) = read {
                    match read.want {
                        Want::Read => readable = true,
                        Want::Write => writable = true,
                    }
                }
                if let Some(write) = write {
                    match write.want {
                        Want::Read => readable = true,
                        Want::Write => writable = true,
                    }
                }
                match (readable, writable) {
                    (true, true) => Event::all(key),
                    (true, false) => Event::readable(key),
                    (false, true) => Event::writable(key),
                    (false, false) => Event::none(key),
                }
            }
        };
        if let Err(e) = self.poller.modify(conn.session.socket(), ev) {
            log::error!("Cannot update client socket interest: {}", e);
            self.close_conn(key, CloseReason::Closed);
        }
    }

    fn process_timeouts(&mut self) {
        let now = Instant::now();
        let expired: Vec<usize> = self
            .conns
            .iter()
            .filter_map(|(key, conn)| match &conn.state {
                ConnState::Handshaking { deadline, .. } if *deadline <= now => Some(key),
                _ => None,
            })
            .collect();
        for key in expired {
            log::trace!("Tls handshake timed out");
            self.close_conn(key, CloseReason::Timeout);
        }
    }

    fn admit_backlog(&mut self) {
        while self.handshakes < self.cfg.max_handshakes {
            match self.backlog.pop_front() {
                Some(task) => self.start_handshake(task),
                None => break,
            }
        }
    }

    fn reject_backlog(&mut self) {
        for task in mem::take(&mut self.backlog) {
            task.resolve(HandshakeOutcome::WorkerPoolClosed);
        }
    }

    /// Deregister the socket, resolve anything still pending and release the
    /// native session. The caller never cleans up after a failure.
    fn close_conn(&mut self, key: usize, reason: CloseReason) {
        let Some(mut conn) = self.conns.try_remove(key) else {
            return;
        };
        if let Err(e) = self.poller.delete(conn.session.socket()) {
            log::trace!("Cannot deregister client socket: {}", e);
        }
        match conn.state {
            ConnState::Handshaking { tx, .. } => {
                self.handshakes -= 1;
                let outcome = match reason {
                    CloseReason::Error(e) => HandshakeOutcome::Failed(e),
                    CloseReason::Timeout => HandshakeOutcome::Timeout,
                    CloseReason::Closed => HandshakeOutcome::Failed(SessionError::Io(
                        "connection closed".to_string(),
                    )),
                    CloseReason::Shutdown => HandshakeOutcome::WorkerPoolClosed,
                };
                let _ = tx.send(outcome);
            }
            ConnState::Established { read, write } => {
                conn.session.shutdown();
                let shutdown = matches!(reason, CloseReason::Shutdown);
                let io_err = || {
                    if shutdown {
                        IoError::Shutdown
                    } else {
                        IoError::Closed
                    }
                };
                if let Some(read) = read {
                    let _ = read.tx.send(Err(io_err()));
                }
                if let Some(write) = write {
                    let _ = write.tx.send(Err(io_err()));
                }
            }
        }
        // the session drops here: native handle released, socket closed
    }

    /// True while no drain is requested or in-flight work remains within the
    /// drain window; once the worker is done every leftover session is
    /// force-closed and the stop is acknowledged.
    fn drain_completed(&mut self) -> bool {
        let Some(stop) = &self.stopping else {
            return false;
        };
        if self.has_inflight() && Instant::now() < stop.deadline {
            return false;
        }

        let keys: Vec<usize> = self.conns.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.close_conn(key, CloseReason::Shutdown);
        }
        if let Some(ack) = self.stopping.take().and_then(|stop| stop.ack) {
            let _ = ack.send(());
        }
        true
    }

    fn has_inflight(&self) -> bool {
        self.conns.iter().any(|(_, conn)| match &conn.state {
            ConnState::Handshaking { .. } => true,
            ConnState::Established { read, write } => read.is_some() || write.is_some(),
        })
    }
}
