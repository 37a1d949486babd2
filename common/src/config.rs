use std::{fmt, path::PathBuf, time::Duration};

use crate::error::ConfigError;

/// Environment variable that overrides the log filter
pub const LOG_FILTER_ENV: &str = "FLYCAT_LOG";

/// Largest datagram read in one call on a UDP socket
pub const UDP_DATAGRAM_CEILING: usize = 64 * 1024;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: i64 = 4000;
pub const DEFAULT_BUFFER_SIZE: i64 = 32 * 1024;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_SHELL_TIMEOUT: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_MAX_CONNECTIONS: i64 = 64;

/// Keepalive probe interval applied to TCP connections when keepalive is on
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Transport protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            _ => Err(ConfigError::UnsupportedProtocol(raw.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// Whether we accept inbound connections or initiate an outbound one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Listen,
    Dial,
}

/// How the dialing side treats the server certificate.
///
/// `Insecure` accepts any certificate and only logs its fingerprint. This is
/// the default for ad-hoc use; `CaFile` opts into verification.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TlsTrust {
    #[default]
    Insecure,
    CaFile(PathBuf),
}

/// PEM files that replace the ephemeral listener certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsIdentityPaths {
    /// Certificate chain, leaf first
    pub cert_path: PathBuf,
    /// Private key matching the leaf certificate
    pub key_path:  PathBuf,
}

/// Unvalidated settings as they arrive from the command line.
///
/// Numeric fields are signed so that out-of-range input can be reported
/// instead of silently wrapping.
#[derive(Debug, Clone)]
pub struct RawConfig {
    pub protocol:        String,
    pub listen:          bool,
    pub host:            String,
    pub port:            i64,
    pub shell:           bool,
    pub tls:             bool,
    pub keepalive:       bool,
    pub buffer_size:     i64,
    pub connect_timeout: Duration,
    pub retries:         i64,
    pub retry_backoff:   Duration,
    pub shell_timeout:   Duration,
    pub max_connections: i64,
    pub once:            bool,
    pub tls_ca:          Option<PathBuf>,
    pub tls_cert:        Option<PathBuf>,
    pub tls_key:         Option<PathBuf>,
    pub verbose:         bool,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            protocol:        "tcp".to_string(),
            listen:          false,
            host:            DEFAULT_HOST.to_string(),
            port:            DEFAULT_PORT,
            shell:           false,
            tls:             false,
            keepalive:       false,
            buffer_size:     DEFAULT_BUFFER_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retries:         0,
            retry_backoff:   DEFAULT_RETRY_BACKOFF,
            shell_timeout:   DEFAULT_SHELL_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            once:            false,
            tls_ca:          None,
            tls_cert:        None,
            tls_key:         None,
            verbose:         true,
        }
    }
}

/// Validated, immutable process configuration.
///
/// Built once at startup with [`Config::from_raw`] and shared read-only
/// (usually behind an `Arc`) with every component that needs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub protocol:        Protocol,
    pub mode:            Mode,
    pub host:            String,
    pub port:            u16,
    pub shell:           bool,
    pub tls:             bool,
    pub keepalive:       bool,
    pub buffer_size:     usize,
    pub connect_timeout: Duration,
    pub retries:         u32,
    pub retry_backoff:   Duration,
    pub shell_timeout:   Duration,
    pub max_connections: usize,
    pub once:            bool,
    pub tls_trust:       TlsTrust,
    pub tls_identity:    Option<TlsIdentityPaths>,
    pub verbose:         bool,
}

impl Config {
    /// Validates raw settings. Nothing touches the network before this
    /// succeeds.
    pub fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let protocol = Protocol::parse(&raw.protocol)?;

        let port = u16::try_from(raw.port)
            .ok()
            .filter(|port| *port != 0)
            .ok_or(ConfigError::PortOutOfRange(raw.port))?;

        let retries =
            u32::try_from(raw.retries).map_err(|_| ConfigError::NegativeRetries(raw.retries))?;

        let buffer_size = usize::try_from(raw.buffer_size)
            .ok()
            .filter(|size| *size > 0)
            .ok_or(ConfigError::NonPositiveBufferSize(raw.buffer_size))?;

        let max_connections = usize::try_from(raw.max_connections)
            .ok()
            .filter(|limit| *limit > 0)
            .ok_or(ConfigError::NonPositiveConnectionLimit(raw.max_connections))?;

        if raw.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }

        if raw.tls && protocol == Protocol::Udp {
            return Err(ConfigError::TlsOverUdp);
        }

        let tls_identity = match (raw.tls_cert, raw.tls_key) {
            (Some(cert_path), Some(key_path)) => Some(TlsIdentityPaths {
                cert_path,
                key_path,
            }),
            (None, None) => None,
            _ => return Err(ConfigError::IncompleteTlsIdentity),
        };

        let tls_trust = raw.tls_ca.map(TlsTrust::CaFile).unwrap_or_default();

        Ok(Self {
            protocol,
            mode: if raw.listen { Mode::Listen } else { Mode::Dial },
            host: raw.host.trim().to_string(),
            port,
            shell: raw.shell,
            tls: raw.tls,
            keepalive: raw.keepalive,
            buffer_size,
            connect_timeout: raw.connect_timeout,
            retries,
            retry_backoff: raw.retry_backoff,
            shell_timeout: raw.shell_timeout,
            max_connections,
            once: raw.once,
            tls_trust,
            tls_identity,
            verbose: raw.verbose,
        })
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}
