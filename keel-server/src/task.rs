use std::future::Future;
use std::net::TcpStream;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::fmt;

use keel_tls::{SessionError, SessionInfo};

use crate::wrk::{IoTask, WorkerCommand, WorkerNotify};

/// Outcome of a submitted handshake.
#[derive(Debug)]
pub enum HandshakeOutcome {
    /// Handshake completed; the handle services encrypted i/o on the
    /// established session.
    Success(TlsConnection),
    /// The tls session could not be created for the socket.
    ConnectionCreationFailed(SessionError),
    /// The peer failed or aborted the handshake.
    Failed(SessionError),
    /// The handshake did not finish within the configured timeout.
    Timeout,
    /// The pool is shutting down; the socket was not used.
    WorkerPoolClosed,
}

/// Per-operation i/o failure.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    /// Fatal native failure; the worker has released the session and the
    /// caller should drop the connection handle.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// The connection was closed while the operation was pending.
    #[error("Connection is closed")]
    Closed,
    /// The worker pool shut down before the operation completed.
    #[error("Server is shutting down")]
    Shutdown,
    /// An operation of the same kind is already pending on this session.
    #[error("Operation of the same kind is already pending")]
    Overlapped,
}

/// Pending handshake for one accepted socket.
pub(crate) struct HandshakeTask {
    pub(crate) sock: TcpStream,
    pub(crate) tx: oneshot::Sender<HandshakeOutcome>,
}

impl HandshakeTask {
    pub(crate) fn resolve(self, outcome: HandshakeOutcome) {
        let _ = self.tx.send(outcome);
    }
}

/// Established server-side TLS connection.
///
/// Owned handle for submitting encrypted reads and writes against the
/// session that stays on its worker thread. Dropping the handle asks the
/// worker to close the session; a pending operation then resolves with
/// [`IoError::Closed`].
pub struct TlsConnection {
    key: usize,
    gen: u64,
    info: SessionInfo,
    notify: WorkerNotify,
}

impl TlsConnection {
    pub(crate) fn new(key: usize, gen: u64, info: SessionInfo, notify: WorkerNotify) -> Self {
        TlsConnection {
            key,
            gen,
            info,
            notify,
        }
    }

    /// Details negotiated during the handshake.
    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Submit an encrypted read of up to `buf.len()` bytes.
    ///
    /// The buffer travels with the task and comes back with the outcome;
    /// a zero-length buffer resolves immediately without touching the
    /// session. At most one read may be pending at a time.
    pub fn read(&self, buf: Vec<u8>) -> ReadReply {
        let (tx, rx) = oneshot::channel();
        if buf.is_empty() {
            let _ = tx.send(Ok((buf, 0)));
        } else {
            let _ = self.notify.send(WorkerCommand::Io {
                key: self.key,
                gen: self.gen,
                task: IoTask::Read { buf, tx },
            });
        }
        ReadReply(rx)
    }

    /// Submit an encrypted write of the whole buffer.
    ///
    /// Short writes are resumed internally from the retained buffer; the
    /// reply resolves once every byte has been handed to the session. At
    /// most one write may be pending at a time.
    pub fn write(&self, buf: Vec<u8>) -> WriteReply {
        let (tx, rx) = oneshot::channel();
        if buf.is_empty() {
            let _ = tx.send(Ok(0));
        } else {
            let _ = self.notify.send(WorkerCommand::Io {
                key: self.key,
                gen: self.gen,
                task: IoTask::Write {
                    buf,
                    written: 0,
                    tx,
                },
            });
        }
        WriteReply(rx)
    }

    /// Close the connection. Equivalent to dropping the handle.
    pub fn close(self) {}
}

impl Drop for TlsConnection {
    fn drop(&mut self) {
        let _ = self.notify.send(WorkerCommand::Close {
            key: self.key,
            gen: self.gen,
        });
    }
}

impl fmt::Debug for TlsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnection")
            .field("key", &self.key)
            .field("info", &self.info)
            .finish()
    }
}

/// Completion handle for a submitted handshake.
#[must_use = "the handshake outcome must be observed"]
pub struct HandshakeReply(pub(crate) oneshot::Receiver<HandshakeOutcome>);

impl HandshakeReply {
    /// Block until the handshake resolves.
    pub fn recv(self) -> HandshakeOutcome {
        self.0.recv().unwrap_or(HandshakeOutcome::WorkerPoolClosed)
    }

    /// Outcome if it is already available.
    pub fn try_recv(&self) -> Option<HandshakeOutcome> {
        self.0.try_recv().ok()
    }
}

impl Future for HandshakeReply {
    type Output = HandshakeOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|res| res.unwrap_or(HandshakeOutcome::WorkerPoolClosed))
    }
}

impl fmt::Debug for HandshakeReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeReply").finish()
    }
}

/// Completion handle for a submitted read.
///
/// Resolves with the buffer and the number of bytes read; zero bytes is the
/// end-of-stream indication, not an error.
#[must_use = "the read outcome must be observed"]
pub struct ReadReply(pub(crate) oneshot::Receiver<Result<(Vec<u8>, usize), IoError>>);

impl ReadReply {
    /// Block until the read resolves.
    pub fn recv(self) -> Result<(Vec<u8>, usize), IoError> {
        self.0.recv().unwrap_or(Err(IoError::Shutdown))
    }
}

impl Future for ReadReply {
    type Output = Result<(Vec<u8>, usize), IoError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(IoError::Shutdown)))
    }
}

impl fmt::Debug for ReadReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadReply").finish()
    }
}

/// Completion handle for a submitted write.
///
/// Resolves with the total number of bytes transferred, which equals the
/// requested length on success.
#[must_use = "the write outcome must be observed"]
pub struct WriteReply(pub(crate) oneshot::Receiver<Result<usize, IoError>>);

impl WriteReply {
    /// Block until the write resolves.
    pub fn recv(self) -> Result<usize, IoError> {
        self.0.recv().unwrap_or(Err(IoError::Shutdown))
    }
}

impl Future for WriteReply {
    type Output = Result<usize, IoError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(IoError::Shutdown)))
    }
}

impl fmt::Debug for WriteReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteReply").finish()
    }
}
