use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use flycat_client::Dialer;
use flycat_common::{
    certificate::{CertificateProvider, TlsIdentity},
    config::{Config, Protocol, RawConfig},
    error::CertificateError,
    tls,
};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, UdpSocket},
};

const WAIT: Duration = Duration::from_secs(5);

fn config(addr: SocketAddr, edit: impl FnOnce(&mut RawConfig)) -> Arc<Config> {
    let mut raw = RawConfig {
        host: addr.ip().to_string(),
        port: i64::from(addr.port()),
        connect_timeout: Duration::from_secs(2),
        retry_backoff: Duration::from_millis(50),
        ..RawConfig::default()
    };
    edit(&mut raw);
    Arc::new(Config::from_raw(raw).unwrap())
}

async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Accepts one TLS client and greets it.
async fn tls_greeter(identity: TlsIdentity) -> SocketAddr {
    let acceptor = tls::acceptor(identity).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        if let Ok(mut stream) = acceptor.accept(tcp).await {
            let _ = stream.write_all(b"hello").await;
            let _ = stream.shutdown().await;
        }
    });
    addr
}

#[tokio::test]
async fn exhausted_retries_report_every_attempt() {
    let addr = closed_port().await;
    let dialer = Dialer::new(config(addr, |raw| raw.retries = 2)).unwrap();

    let started = Instant::now();
    let err = dialer.dial().await.unwrap_err();
    assert_eq!(err.attempts, 3);
    assert_eq!(err.target, addr.to_string());
    // 0 + 50ms + 100ms of backoff
    assert!(started.elapsed() >= Duration::from_millis(150));
}

#[tokio::test]
async fn zero_retries_means_one_attempt() {
    let addr = closed_port().await;
    let dialer = Dialer::new(config(addr, |_| {})).unwrap();
    let err = dialer.dial().await.unwrap_err();
    assert_eq!(err.attempts, 1);
}

#[tokio::test]
async fn plain_tcp_dial() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut got = Vec::new();
        stream.read_to_end(&mut got).await.unwrap();
        got
    });

    let mut conn = Dialer::new(config(addr, |raw| raw.keepalive = true))
        .unwrap()
        .dial()
        .await
        .unwrap();
    assert_eq!(conn.peer(), addr);
    assert_eq!(conn.protocol(), Protocol::Tcp);
    conn.write_all(b"payload").await.unwrap();
    conn.shutdown().await.unwrap();
    assert_eq!(server.await.unwrap(), b"payload");
}

#[tokio::test]
async fn tls_dial_accepts_ephemeral_certificate() {
    let addr = tls_greeter(CertificateProvider::generate().unwrap()).await;
    let mut conn = Dialer::new(config(addr, |raw| raw.tls = true))
        .unwrap()
        .dial()
        .await
        .unwrap();
    assert!(conn.stream().is_tls());

    let mut greeting = Vec::new();
    tokio::time::timeout(WAIT, conn.read_to_end(&mut greeting))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(greeting, b"hello");
}

fn trusted_identity() -> (TlsIdentity, tempfile::NamedTempFile) {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string(), "127.0.0.1".to_string()])
            .unwrap();
    let ca = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(ca.path(), cert.pem()).unwrap();
    let identity = TlsIdentity {
        cert_chain: vec![cert.der().clone()],
        key:        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
    };
    (identity, ca)
}

#[tokio::test]
async fn tls_dial_verifies_against_ca_file() {
    let (identity, ca) = trusted_identity();
    let addr = tls_greeter(identity).await;
    let ca_path = ca.path().to_path_buf();
    let mut conn = Dialer::new(config(addr, |raw| {
        raw.tls = true;
        raw.tls_ca = Some(ca_path);
    }))
    .unwrap()
    .dial()
    .await
    .unwrap();

    let mut greeting = Vec::new();
    conn.read_to_end(&mut greeting).await.unwrap();
    assert_eq!(greeting, b"hello");
}

#[tokio::test]
async fn untrusted_certificate_fails_the_attempt() {
    let (_trusted, ca) = trusted_identity();
    let addr = tls_greeter(CertificateProvider::generate().unwrap()).await;
    let ca_path = ca.path().to_path_buf();
    let err = Dialer::new(config(addr, |raw| {
        raw.tls = true;
        raw.tls_ca = Some(ca_path);
    }))
    .unwrap()
    .dial()
    .await
    .unwrap_err();
    assert_eq!(err.attempts, 1);
}

#[test]
fn unreadable_ca_file_fails_before_dialing() {
    let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
    let result = Dialer::new(config(addr, |raw| {
        raw.tls = true;
        raw.tls_ca = Some(PathBuf::from("/nonexistent/flycat-ca.pem"));
    }));
    assert!(matches!(result, Err(CertificateError::Read { .. })));
}

#[tokio::test]
async fn udp_dial_sends_datagrams_to_the_target() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();

    let mut conn = Dialer::new(config(addr, |raw| raw.protocol = "udp".to_string()))
        .unwrap()
        .dial()
        .await
        .unwrap();
    assert_eq!(conn.protocol(), Protocol::Udp);
    conn.write_all(b"datagram").await.unwrap();

    let mut buf = [0u8; 64];
    let (n, from) = tokio::time::timeout(WAIT, server.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"datagram");

    server.send_to(b"reply", from).await.unwrap();
    let mut reply = [0u8; 64];
    let n = tokio::time::timeout(WAIT, conn.read(&mut reply)).await.unwrap().unwrap();
    assert_eq!(&reply[..n], b"reply");
}
