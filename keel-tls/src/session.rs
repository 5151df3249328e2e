use std::{fmt, net::TcpStream};

use tls_openssl::ssl::{ErrorCode, NameType, SslStream};

use crate::ctx::TlsServerContext;
use crate::error::SessionError;

/// Result of a single non-blocking handshake step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Handshake finished, the session is established.
    Done,
    /// More handshake data from the peer is needed.
    WantRead,
    /// Pending handshake data could not be flushed to the socket.
    WantWrite,
}

/// Result of a single non-blocking read or write step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStep {
    Done(usize),
    WantRead,
    WantWrite,
    /// Peer sent a clean tls shutdown.
    Eof,
}

/// Details captured from an established session.
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    /// ALPN protocol negotiated during the handshake, if any.
    pub alpn: Option<Vec<u8>>,
    /// SNI servername the client asked for, if any.
    pub servername: Option<String>,
    /// Negotiated protocol version, e.g. `TLSv1.3`.
    pub version: &'static str,
}

/// Per-connection TLS session over a non-blocking client socket.
///
/// The native session handle is not synchronized; every call must stay on
/// the single worker thread that owns the session. Dropping the session
/// releases the native handle and closes the socket.
pub struct ServerSession {
    stream: SslStream<TcpStream>,
}

impl ServerSession {
    /// Bind a fresh server session to an accepted client socket.
    ///
    /// The socket is switched to non-blocking mode first; from here on every
    /// native call reports would-block instead of stalling the thread.
    pub fn new(ctx: &TlsServerContext, sock: TcpStream) -> Result<ServerSession, SessionError> {
        sock.set_nonblocking(true)?;
        sock.set_nodelay(true)?;
        let ssl = ctx.new_ssl()?;
        let stream = SslStream::new(ssl, sock)?;
        Ok(ServerSession { stream })
    }

    /// Advance the server-side handshake by one step.
    pub fn handshake_step(&mut self) -> Result<HandshakeStep, SessionError> {
        match self.stream.accept() {
            Ok(()) => Ok(HandshakeStep::Done),
            Err(e) => match e.code() {
                ErrorCode::WANT_READ => Ok(HandshakeStep::WantRead),
                ErrorCode::WANT_WRITE => Ok(HandshakeStep::WantWrite),
                _ => Err(SessionError::Handshake(e.to_string())),
            },
        }
    }

    /// Read decrypted bytes into `buf`.
    ///
    /// A clean shutdown from the peer is `Eof`, not an error. An abrupt
    /// transport close is fatal; the caller decides what to do with the
    /// connection.
    pub fn read_step(&mut self, buf: &mut [u8]) -> Result<IoStep, SessionError> {
        match self.stream.ssl_read(buf) {
            Ok(n) => Ok(IoStep::Done(n)),
            Err(e) => match e.code() {
                ErrorCode::WANT_READ => Ok(IoStep::WantRead),
                ErrorCode::WANT_WRITE => Ok(IoStep::WantWrite),
                ErrorCode::ZERO_RETURN => Ok(IoStep::Eof),
                _ => Err(SessionError::Io(e.to_string())),
            },
        }
    }

    /// Encrypt and write bytes from `buf`.
    ///
    /// May report a short write; the caller resumes with the remaining tail
    /// of the same buffer once the socket is writable again.
    pub fn write_step(&mut self, buf: &[u8]) -> Result<IoStep, SessionError> {
        match self.stream.ssl_write(buf) {
            Ok(n) => Ok(IoStep::Done(n)),
            Err(e) => match e.code() {
                ErrorCode::WANT_READ => Ok(IoStep::WantRead),
                ErrorCode::WANT_WRITE => Ok(IoStep::WantWrite),
                ErrorCode::ZERO_RETURN => Ok(IoStep::Eof),
                _ => Err(SessionError::Io(e.to_string())),
            },
        }
    }

    /// Single best-effort `close_notify` step.
    ///
    /// Would-block is not a failure here; the alert either made it into the
    /// socket buffer or the peer is already gone.
    pub fn shutdown(&mut self) {
        match self.stream.shutdown() {
            Ok(_) => (),
            Err(ref e) if e.code() == ErrorCode::ZERO_RETURN => (),
            Err(ref e)
                if e.code() == ErrorCode::WANT_READ || e.code() == ErrorCode::WANT_WRITE => {}
            Err(e) => log::trace!("Tls shutdown alert failed: {}", e),
        }
    }

    /// Socket handle for readiness registration.
    pub fn socket(&self) -> &TcpStream {
        self.stream.get_ref()
    }

    /// Negotiated session details; meaningful once the handshake is done.
    pub fn info(&self) -> SessionInfo {
        let ssl = self.stream.ssl();
        SessionInfo {
            alpn: ssl.selected_alpn_protocol().map(Vec::from),
            servername: ssl.servername(NameType::HOST_NAME).map(String::from),
            version: ssl.version_str(),
        }
    }
}

impl fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSession")
            .field("peer", &self.stream.get_ref().peer_addr().ok())
            .field("version", &self.stream.ssl().version_str())
            .finish()
    }
}
