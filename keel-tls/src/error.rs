use std::{io, path::PathBuf};

use tls_openssl::error::ErrorStack;

/// Failure while building the shared server context.
///
/// Each variant names the stage that failed, so a key that does not belong
/// to the configured certificate is reported as exactly that instead of a
/// handshake error long after startup.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("Cannot create ssl context: {0}")]
    Create(#[source] ErrorStack),
    #[error("Cannot load certificate chain from {path:?}: {source}")]
    Certificate { path: PathBuf, source: ErrorStack },
    #[error("Cannot load private key from {path:?}: {source}")]
    PrivateKey { path: PathBuf, source: ErrorStack },
    #[error("Private key does not match certificate chain: {0}")]
    KeyMismatch(#[source] ErrorStack),
}

/// Fatal per-connection failure.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The client socket could not be prepared for non-blocking use.
    #[error("Cannot prepare client socket: {0}")]
    Socket(#[from] io::Error),
    /// The per-connection ssl session object could not be created.
    #[error("Cannot create tls session: {0}")]
    Create(#[from] ErrorStack),
    #[error("Tls handshake failed: {0}")]
    Handshake(String),
    #[error("Tls i/o failed: {0}")]
    Io(String),
}
