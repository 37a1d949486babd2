//! Error taxonomy for connection setup and per-session faults.
//!
//! Errors raised before any connection exists ([`ConfigError`],
//! [`DialError`], [`ListenSetupError`], [`CertificateError`]) are fatal to the
//! process. The rest are confined to a single connection or datagram and are
//! logged by whoever owns that connection.

use std::{io, net::SocketAddr, path::PathBuf};

/// Invalid configuration, detected before any socket is opened.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("port {0} is out of range (1-65535)")]
    PortOutOfRange(i64),

    #[error("unsupported protocol {0:?} (expected tcp or udp)")]
    UnsupportedProtocol(String),

    #[error("retry count must not be negative, got {0}")]
    NegativeRetries(i64),

    #[error("buffer size must be positive, got {0}")]
    NonPositiveBufferSize(i64),

    #[error("max connections must be positive, got {0}")]
    NonPositiveConnectionLimit(i64),

    #[error("TLS is not supported over UDP")]
    TlsOverUdp,

    #[error("TLS certificate and key must be supplied together")]
    IncompleteTlsIdentity,

    #[error("host must not be empty")]
    EmptyHost,
}

/// Every dial attempt failed.
#[derive(Debug, thiserror::Error)]
#[error("dial {target} failed after {attempts} attempt(s): {source}")]
pub struct DialError {
    pub target:   String,
    pub attempts: u32,
    #[source]
    pub source:   io::Error,
}

/// The listener could not be started.
#[derive(Debug, thiserror::Error)]
pub enum ListenSetupError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr:   String,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Certificate(#[from] CertificateError),

    #[error("failed to build TLS server configuration: {0}")]
    Tls(#[from] rustls::Error),
}

/// TLS handshake failure on one accepted or dialed connection.
#[derive(Debug, thiserror::Error)]
#[error("TLS handshake with {peer} failed: {source}")]
pub struct HandshakeError {
    pub peer:   SocketAddr,
    #[source]
    pub source: io::Error,
}

/// Read or write failure on an established connection or local stream.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("connection read failed: {0}")]
    ConnectionRead(#[source] io::Error),

    #[error("connection write failed: {0}")]
    ConnectionWrite(#[source] io::Error),

    #[error("local input read failed: {0}")]
    LocalRead(#[source] io::Error),

    #[error("local output write failed: {0}")]
    LocalWrite(#[source] io::Error),
}

/// Spawn failure or unsuccessful exit of the bridged shell.
#[derive(Debug, thiserror::Error)]
pub enum ShellExecutionError {
    #[error("failed to spawn {shell}: {source}")]
    Spawn {
        shell:  String,
        #[source]
        source: io::Error,
    },

    #[error("{shell} exited with {status}")]
    NonZeroExit {
        shell:  String,
        status: std::process::ExitStatus,
    },

    #[error("{shell} killed after session timeout of {timeout:?}")]
    TimedOut {
        shell:   String,
        timeout: std::time::Duration,
    },

    #[error("waiting on {shell} failed: {source}")]
    Wait {
        shell:  String,
        #[source]
        source: io::Error,
    },
}

/// Failure to produce the listener's TLS identity.
#[derive(Debug, thiserror::Error)]
pub enum CertificateError {
    #[error("key generation failed: {0}")]
    KeyGeneration(#[source] rcgen::Error),

    #[error("certificate parameters rejected: {0}")]
    Params(#[source] rcgen::Error),

    #[error("certificate signing failed: {0}")]
    Signing(#[source] rcgen::Error),

    #[error("failed to read {path:?}: {source}")]
    Read {
        path:   PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no certificate found in {0:?}")]
    NoCertificate(PathBuf),

    #[error("no private key found in {0:?}")]
    NoPrivateKey(PathBuf),

    #[error("TLS configuration rejected: {0}")]
    Tls(#[from] rustls::Error),
}
