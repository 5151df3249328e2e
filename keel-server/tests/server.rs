use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use std::{fs, thread};

use keel_server::{HandshakeOutcome, IoError, TlsConnection, WorkerPool};
use keel_tls::TlsServerContext;
use rcgen::{generate_simple_self_signed, CertifiedKey};
use tls_openssl::ssl::{SslConnector, SslMethod, SslStream, SslVerifyMode};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Mint a self-signed certificate/key pair and park it in the temp dir.
fn write_cert_pair(tag: &str) -> (PathBuf, PathBuf) {
    let CertifiedKey { cert, key_pair } =
        generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();

    let dir = std::env::temp_dir();
    let pid = std::process::id();
    let cert_path = dir.join(format!("keel-server-{}-{}-cert.pem", tag, pid));
    let key_path = dir.join(format!("keel-server-{}-{}-key.pem", tag, pid));
    fs::write(&cert_path, cert.pem()).unwrap();
    fs::write(&key_path, key_pair.serialize_pem()).unwrap();
    (cert_path, key_path)
}

fn test_context(tag: &str) -> TlsServerContext {
    let (cert, key) = write_cert_pair(tag);
    TlsServerContext::new(cert, key).unwrap()
}

/// Blocking tls client against the pool under test.
fn connect(addr: SocketAddr) -> SslStream<TcpStream> {
    let mut builder = SslConnector::builder(SslMethod::tls()).unwrap();
    builder.set_verify(SslVerifyMode::NONE);
    let connector = builder.build();
    let sock = TcpStream::connect(addr).unwrap();
    connector.connect("localhost", sock).unwrap()
}

fn expect_success(outcome: HandshakeOutcome) -> TlsConnection {
    match outcome {
        HandshakeOutcome::Success(conn) => conn,
        outcome => panic!("unexpected handshake outcome: {:?}", outcome),
    }
}

#[test]
fn handshake_and_echo_round_trip() {
    init_logging();
    let pool = WorkerPool::builder()
        .workers(2)
        .shutdown_timeout(Duration::from_secs(3))
        .run(test_context("echo"));

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let client = thread::spawn(move || {
        let mut tls = connect(addr);
        tls.write_all(b"hello keel").unwrap();
        let mut buf = [0u8; 10];
        tls.read_exact(&mut buf).unwrap();
        buf.to_vec()
    });

    let (sock, _) = listener.accept().unwrap();
    let conn = expect_success(pool.submit(sock).recv());
    assert!(conn.info().version.starts_with("TLS"));

    let (buf, n) = conn.read(vec![0u8; 64]).recv().unwrap();
    assert_eq!(&buf[..n], b"hello keel");

    let sent = conn.write(buf[..n].to_vec()).recv().unwrap();
    assert_eq!(sent, n);

    assert_eq!(client.join().unwrap(), b"hello keel");

    conn.close();
    pool.shutdown();
}

#[test]
fn silent_client_times_out() {
    init_logging();
    let pool = WorkerPool::builder()
        .workers(1)
        .handshake_timeout(Duration::from_millis(400))
        .shutdown_timeout(Duration::from_secs(1))
        .run(test_context("timeout"));

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    // connects and then never says anything
    let _client = TcpStream::connect(addr).unwrap();
    let (sock, _) = listener.accept().unwrap();

    let started = Instant::now();
    let outcome = pool.submit(sock).recv();
    let elapsed = started.elapsed();

    assert!(
        matches!(outcome, HandshakeOutcome::Timeout),
        "unexpected outcome: {:?}",
        outcome
    );
    assert!(elapsed >= Duration::from_millis(300), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "{:?}", elapsed);

    pool.shutdown();
}

#[test]
fn aborted_handshake_fails() {
    init_logging();
    let pool = WorkerPool::builder()
        .workers(1)
        .handshake_timeout(Duration::from_secs(2))
        .shutdown_timeout(Duration::from_secs(1))
        .run(test_context("abort"));

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    // connect and hang up before the client hello
    drop(TcpStream::connect(addr).unwrap());
    let (sock, _) = listener.accept().unwrap();

    let outcome = pool.submit(sock).recv();
    assert!(
        matches!(outcome, HandshakeOutcome::Failed(_)),
        "unexpected outcome: {:?}",
        outcome
    );

    pool.shutdown();
}

#[test]
fn submit_after_shutdown_fast_fails() {
    init_logging();
    let pool = WorkerPool::builder()
        .workers(1)
        .shutdown_timeout(Duration::from_secs(1))
        .run(test_context("closed"));
    pool.shutdown();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let _client = TcpStream::connect(addr).unwrap();
    let (sock, _) = listener.accept().unwrap();

    let started = Instant::now();
    let outcome = pool.submit(sock).recv();
    assert!(
        matches!(outcome, HandshakeOutcome::WorkerPoolClosed),
        "unexpected outcome: {:?}",
        outcome
    );
    assert!(started.elapsed() < Duration::from_millis(100));

    // shutdown is idempotent
    pool.shutdown();
}

#[test]
fn concurrent_handshakes_all_resolve() {
    init_logging();
    const N: usize = 8;

    let pool = WorkerPool::builder()
        .workers(2)
        .shutdown_timeout(Duration::from_secs(3))
        .run(test_context("concurrent"));

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let clients: Vec<_> = (0..N)
        .map(|i| {
            thread::spawn(move || {
                let mut tls = connect(addr);
                let msg = format!("msg-{}", i).into_bytes();
                tls.write_all(&msg).unwrap();
                let mut buf = vec![0u8; msg.len()];
                tls.read_exact(&mut buf).unwrap();
                assert_eq!(buf, msg);
            })
        })
        .collect();

    let mut replies = Vec::new();
    for _ in 0..N {
        let (sock, _) = listener.accept().unwrap();
        replies.push(pool.submit(sock));
    }

    for reply in replies {
        let conn = expect_success(reply.recv());
        let (buf, n) = conn.read(vec![0u8; 32]).recv().unwrap();
        assert!(n > 0);
        assert_eq!(conn.write(buf[..n].to_vec()).recv().unwrap(), n);
        conn.close();
    }

    for client in clients {
        client.join().unwrap();
    }
    pool.shutdown();
}

#[test]
fn large_write_resumes_until_complete() {
    init_logging();
    let pool = WorkerPool::builder()
        .workers(1)
        .shutdown_timeout(Duration::from_secs(5))
        .run(test_context("large"));

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let len = payload.len();

    // slow reader so the server side hits short writes and resumes
    let client = thread::spawn(move || {
        let mut tls = connect(addr);
        let mut data = vec![0u8; len];
        let mut read = 0;
        while read < len {
            let n = tls.read(&mut data[read..]).unwrap();
            assert!(n > 0, "stream ended early at {} bytes", read);
            read += n;
            thread::sleep(Duration::from_micros(50));
        }
        data
    });

    let (sock, _) = listener.accept().unwrap();
    let conn = expect_success(pool.submit(sock).recv());

    let sent = conn.write(payload).recv().unwrap();
    assert_eq!(sent, len);

    assert_eq!(client.join().unwrap(), expected);

    conn.close();
    pool.shutdown();
}

#[test]
fn close_resolves_pending_read() {
    init_logging();
    let pool = WorkerPool::builder()
        .workers(1)
        .shutdown_timeout(Duration::from_secs(1))
        .run(test_context("cancel"));

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let client = thread::spawn(move || {
        let mut tls = connect(addr);
        // sends nothing; unblocks once the server closes
        let mut buf = [0u8; 4];
        let _ = tls.read(&mut buf);
    });

    let (sock, _) = listener.accept().unwrap();
    let conn = expect_success(pool.submit(sock).recv());

    let reply = conn.read(vec![0u8; 16]);
    drop(conn);

    match reply.recv() {
        Err(IoError::Closed) => (),
        other => panic!("unexpected read outcome: {:?}", other),
    }

    client.join().unwrap();
    pool.shutdown();
}

#[test]
fn overlapping_reads_are_rejected() {
    init_logging();
    let pool = WorkerPool::builder()
        .workers(1)
        .shutdown_timeout(Duration::from_secs(1))
        .run(test_context("overlap"));

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let client = thread::spawn(move || {
        let mut tls = connect(addr);
        let mut buf = [0u8; 4];
        let _ = tls.read(&mut buf);
    });

    let (sock, _) = listener.accept().unwrap();
    let conn = expect_success(pool.submit(sock).recv());

    let first = conn.read(vec![0u8; 16]);
    let second = conn.read(vec![0u8; 16]);

    match second.recv() {
        Err(IoError::Overlapped) => (),
        other => panic!("unexpected read outcome: {:?}", other),
    }

    drop(conn);
    match first.recv() {
        Err(IoError::Closed) => (),
        other => panic!("unexpected read outcome: {:?}", other),
    }

    client.join().unwrap();
    pool.shutdown();
}

#[test]
fn drop_without_shutdown_terminates_pending_io() {
    init_logging();
    let pool = WorkerPool::builder()
        .workers(1)
        .run(test_context("drop"));

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let client = thread::spawn(move || {
        let mut tls = connect(addr);
        let mut buf = [0u8; 4];
        let _ = tls.read(&mut buf);
    });

    let (sock, _) = listener.accept().unwrap();
    let conn = expect_success(pool.submit(sock).recv());

    let reply = conn.read(vec![0u8; 16]);
    drop(pool);

    match reply.recv() {
        Err(IoError::Shutdown) => (),
        other => panic!("unexpected read outcome: {:?}", other),
    }

    drop(conn);
    client.join().unwrap();
}

#[test]
fn alpn_negotiation_surfaces_protocol() {
    init_logging();
    let (cert, key) = write_cert_pair("alpn");
    let ctx = TlsServerContext::with_alpn(&cert, &key, &[b"h2", b"http/1.1"]).unwrap();
    let pool = WorkerPool::builder()
        .workers(1)
        .shutdown_timeout(Duration::from_secs(1))
        .run(ctx);

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let client = thread::spawn(move || {
        let mut builder = SslConnector::builder(SslMethod::tls()).unwrap();
        builder.set_verify(SslVerifyMode::NONE);
        builder.set_alpn_protos(b"\x08http/1.1").unwrap();
        let connector = builder.build();
        let sock = TcpStream::connect(addr).unwrap();
        let tls = connector.connect("localhost", sock).unwrap();
        assert_eq!(
            tls.ssl().selected_alpn_protocol(),
            Some(&b"http/1.1"[..])
        );
    });

    let (sock, _) = listener.accept().unwrap();
    let conn = expect_success(pool.submit(sock).recv());
    assert_eq!(conn.info().alpn.as_deref(), Some(&b"http/1.1"[..]));

    client.join().unwrap();
    conn.close();
    pool.shutdown();
}
