use std::{io, sync::Arc, time::Duration};

use flycat_common::{
    certificate,
    config::{Config, Protocol},
    error::{CertificateError, DialError},
    platform::tune_tcp,
    stream::{Connection, NetStream},
    tls,
};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio_rustls::TlsConnector;

/// Delay before attempt `attempt` (zero based). Linear: the first attempt
/// goes out immediately, then one `unit` more per retry.
pub fn backoff_delay(attempt: u32, unit: Duration) -> Duration {
    unit.saturating_mul(attempt)
}

/// Outbound side: connects to `config.host:config.port` with bounded
/// per-attempt timeouts and linear backoff between attempts.
pub struct Dialer {
    config:    Arc<Config>,
    connector: Option<TlsConnector>,
}

impl Dialer {
    /// Prepares the TLS client configuration up front so a bad CA file fails
    /// before any connection attempt.
    pub fn new(config: Arc<Config>) -> Result<Self, CertificateError> {
        let connector = if config.tls && config.protocol == Protocol::Tcp {
            Some(tls::connector(&config.tls_trust)?)
        } else {
            None
        };
        Ok(Self { config, connector })
    }

    /// Makes up to `retries + 1` attempts and returns the first connection
    /// that succeeds, or the last failure once every attempt is spent.
    pub async fn dial(&self) -> Result<Connection, DialError> {
        let target = self.config.address();
        let attempts = self.config.retries.saturating_add(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            let delay = backoff_delay(attempt, self.config.retry_backoff);
            if !delay.is_zero() {
                tracing::info!(
                    "Retrying {} in {:?} (attempt {}/{})",
                    target,
                    delay,
                    attempt + 1,
                    attempts
                );
                tokio::time::sleep(delay).await;
            }

            let outcome = tokio::time::timeout(self.config.connect_timeout, self.connect(&target))
                .await
                .unwrap_or_else(|_| {
                    Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no answer within {:?}", self.config.connect_timeout),
                    ))
                });

            match outcome {
                Ok(conn) => {
                    tracing::info!("Connected to {}://{}", conn.protocol(), conn.peer());
                    return Ok(conn);
                }
                Err(e) => {
                    tracing::warn!(
                        "Attempt {}/{} to {} failed: {}",
                        attempt + 1,
                        attempts,
                        target,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(DialError {
            target,
            attempts,
            source: last_error
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no attempt was made")),
        })
    }

    async fn connect(&self, target: &str) -> io::Result<Connection> {
        match self.config.protocol {
            Protocol::Tcp => self.connect_tcp(target).await,
            Protocol::Udp => connect_udp(target).await,
        }
    }

    async fn connect_tcp(&self, target: &str) -> io::Result<Connection> {
        let tcp = TcpStream::connect(target).await?;
        let peer = tcp.peer_addr()?;
        if let Err(e) = tune_tcp(&tcp, self.config.keepalive) {
            tracing::warn!("Failed to tune connection to {}: {}", peer, e);
        }

        let Some(connector) = &self.connector else {
            return Ok(Connection::new(NetStream::Tcp(tcp), peer));
        };

        let name = tls::server_name(&self.config.host)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let stream = NetStream::ClientTls(Box::new(connector.connect(name, tcp).await?));
        if let Some(leaf) = stream.peer_certificates().and_then(|chain| chain.first()) {
            tracing::info!(
                "Server certificate SHA-256 fingerprint: {}",
                certificate::fingerprint(leaf)
            );
        }
        Ok(Connection::new(stream, peer))
    }
}

/// "Connecting" UDP only fixes the peer address; unreachable targets show up
/// later as failed reads or writes.
async fn connect_udp(target: &str) -> io::Result<Connection> {
    let peer = lookup_host(target).await?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("{target} did not resolve"))
    })?;
    let local = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(peer).await?;
    Ok(Connection::new(NetStream::Udp(socket), peer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_linear_from_zero() {
        let unit = Duration::from_millis(250);
        assert_eq!(backoff_delay(0, unit), Duration::ZERO);
        assert_eq!(backoff_delay(1, unit), Duration::from_millis(250));
        assert_eq!(backoff_delay(4, unit), Duration::from_secs(1));
    }

    #[test]
    fn backoff_saturates() {
        assert_eq!(backoff_delay(u32::MAX, Duration::MAX), Duration::MAX);
    }
}
