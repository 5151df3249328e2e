use std::{fs, path::PathBuf};

use keel_tls::{ContextError, TlsServerContext};
use rcgen::{generate_simple_self_signed, CertifiedKey};

/// Mint a self-signed certificate/key pair and park it in the temp dir.
fn write_cert_pair(tag: &str) -> (PathBuf, PathBuf) {
    let CertifiedKey { cert, key_pair } =
        generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();

    let dir = std::env::temp_dir();
    let pid = std::process::id();
    let cert_path = dir.join(format!("keel-tls-{}-{}-cert.pem", tag, pid));
    let key_path = dir.join(format!("keel-tls-{}-{}-key.pem", tag, pid));
    fs::write(&cert_path, cert.pem()).unwrap();
    fs::write(&key_path, key_pair.serialize_pem()).unwrap();
    (cert_path, key_path)
}

#[test]
fn construct_with_valid_pair() {
    let (cert, key) = write_cert_pair("valid");
    let ctx = TlsServerContext::new(&cert, &key).unwrap();
    assert_eq!(ctx.certificate_path(), cert.as_path());
    assert_eq!(ctx.private_key_path(), key.as_path());
}

#[test]
fn repeated_construct_and_dispose() {
    let (cert, key) = write_cert_pair("cycles");
    for _ in 0..32 {
        let ctx = TlsServerContext::new(&cert, &key).unwrap();
        drop(ctx);
    }
}

#[test]
fn mismatched_key_is_reported_as_mismatch() {
    let (cert_a, _key_a) = write_cert_pair("mismatch-a");
    let (_cert_b, key_b) = write_cert_pair("mismatch-b");

    let err = TlsServerContext::new(&cert_a, &key_b).unwrap_err();
    assert!(
        matches!(err, ContextError::KeyMismatch(_)),
        "expected key mismatch, got: {}",
        err
    );
}

#[test]
fn missing_certificate_names_the_stage() {
    let (_cert, key) = write_cert_pair("no-cert");
    let err = TlsServerContext::new("/nonexistent/keel-cert.pem", &key).unwrap_err();
    assert!(
        matches!(err, ContextError::Certificate { .. }),
        "expected certificate stage error, got: {}",
        err
    );
}

#[test]
fn missing_key_names_the_stage() {
    let (cert, _key) = write_cert_pair("no-key");
    let err = TlsServerContext::new(&cert, "/nonexistent/keel-key.pem").unwrap_err();
    assert!(
        matches!(err, ContextError::PrivateKey { .. }),
        "expected private key stage error, got: {}",
        err
    );
}

#[test]
fn alpn_context_constructs() {
    let (cert, key) = write_cert_pair("alpn");
    TlsServerContext::with_alpn(&cert, &key, &[b"h2", b"http/1.1"]).unwrap();
}
