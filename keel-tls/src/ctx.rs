use std::path::{Path, PathBuf};
use std::{fmt, sync::Once};

use tls_openssl::error::ErrorStack;
use tls_openssl::ssl::{self, AlpnError, Ssl, SslAcceptor, SslFiletype, SslMethod};

use crate::error::ContextError;

static CRYPTO_INIT: Once = Once::new();

/// Shared server-side TLS configuration.
///
/// Holds the loaded certificate chain and matching private key. Built once
/// at listener startup, immutable afterwards; workers read it concurrently
/// through an `Arc` without synchronization. The native context handle is
/// released exactly once when the last reference drops.
pub struct TlsServerContext {
    acceptor: SslAcceptor,
    cert: PathBuf,
    key: PathBuf,
}

impl TlsServerContext {
    /// Load a certificate chain and matching private key, both PEM files.
    ///
    /// Fails fast with the stage that went wrong: context creation,
    /// certificate load, key load, or key/certificate mismatch.
    pub fn new(
        cert: impl AsRef<Path>,
        key: impl AsRef<Path>,
    ) -> Result<TlsServerContext, ContextError> {
        Self::build(cert.as_ref(), key.as_ref(), &[])
    }

    /// Same as [`TlsServerContext::new`] with a server-side ALPN preference
    /// list, most preferred first (e.g. `[b"h2", b"http/1.1"]`).
    pub fn with_alpn(
        cert: impl AsRef<Path>,
        key: impl AsRef<Path>,
        protos: &[&[u8]],
    ) -> Result<TlsServerContext, ContextError> {
        Self::build(cert.as_ref(), key.as_ref(), protos)
    }

    fn build(cert: &Path, key: &Path, protos: &[&[u8]]) -> Result<TlsServerContext, ContextError> {
        CRYPTO_INIT.call_once(tls_openssl::init);

        // mozilla_intermediate_v5 pins the protocol floor to TLSv1.2
        let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())
            .map_err(ContextError::Create)?;
        builder
            .set_certificate_chain_file(cert)
            .map_err(|source| ContextError::Certificate {
                path: cert.to_owned(),
                source,
            })?;
        builder
            .set_private_key_file(key, SslFiletype::PEM)
            .map_err(|source| ContextError::PrivateKey {
                path: key.to_owned(),
                source,
            })?;
        builder
            .check_private_key()
            .map_err(ContextError::KeyMismatch)?;

        if !protos.is_empty() {
            // The ALPN select callback must be `'static`, and a `Fn` closure
            // cannot return a borrow of a captured value; the server list passed
            // to `select_next_proto` must therefore be `'static`. The acceptor and
            // its callback live for the process lifetime, so leak the wire buffer.
            let wire: &'static [u8] = Vec::leak(alpn_wire(protos));
            builder.set_alpn_select_callback(move |_, client| {
                ssl::select_next_proto(wire, client).ok_or(AlpnError::NOACK)
            });
        }

        log::trace!("Loaded certificate chain from {:?}", cert);
        Ok(TlsServerContext {
            acceptor: builder.build(),
            cert: cert.to_owned(),
            key: key.to_owned(),
        })
    }

    /// Path of the loaded certificate chain file.
    pub fn certificate_path(&self) -> &Path {
        &self.cert
    }

    /// Path of the loaded private key file.
    pub fn private_key_path(&self) -> &Path {
        &self.key
    }

    pub(crate) fn new_ssl(&self) -> Result<Ssl, ErrorStack> {
        Ssl::new(self.acceptor.context())
    }
}

impl fmt::Debug for TlsServerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsServerContext")
            .field("cert", &self.cert)
            .field("key", &self.key)
            .finish()
    }
}

/// ALPN protocol list in wire format, each protocol length-prefixed.
fn alpn_wire(protos: &[&[u8]]) -> Vec<u8> {
    let mut wire = Vec::with_capacity(protos.iter().map(|p| p.len() + 1).sum());
    for proto in protos {
        debug_assert!(proto.len() <= u8::MAX as usize);
        wire.push(proto.len() as u8);
        wire.extend_from_slice(proto);
    }
    wire
}
