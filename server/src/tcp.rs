use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use flycat_common::{
    certificate::CertificateProvider,
    config::Config,
    error::{HandshakeError, ListenSetupError},
    platform::tune_accepted,
    stream::{Connection, NetStream},
    tls,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::Semaphore,
};
use tokio_rustls::TlsAcceptor;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// Pause after a failed accept so resource exhaustion does not spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// TCP listener that hands each accepted (and, with TLS, handshaken)
/// connection to its own task.
pub struct TcpServer {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    permits:  Arc<Semaphore>,
    config:   Arc<Config>,
}

impl TcpServer {
    /// Binds `config.host:config.port`. With TLS enabled the listener
    /// identity is produced here, before anything is accepted.
    pub async fn bind(config: Arc<Config>) -> Result<Self, ListenSetupError> {
        let addr = config.address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ListenSetupError::Bind { addr, source })?;
        Self::from_listener(listener, config)
    }

    /// Wraps an already bound listener.
    pub fn from_listener(
        listener: TcpListener,
        config: Arc<Config>,
    ) -> Result<Self, ListenSetupError> {
        let acceptor = if config.tls {
            let identity = CertificateProvider::resolve(config.tls_identity.as_ref())?;
            Some(tls::acceptor(identity)?)
        } else {
            None
        };

        Ok(Self {
            listener,
            acceptor,
            permits: Arc::new(Semaphore::new(config.max_connections)),
            config,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts until `shutdown` fires (or after the first connection in once
    /// mode), then drops the listener and returns the tracker of session
    /// tasks still running. Those tasks are not cancelled.
    ///
    /// At most `max_connections` sessions run at once; while all permits are
    /// taken nothing is accepted and new clients wait in the backlog.
    pub async fn serve<H, Fut>(self, handler: H, shutdown: CancellationToken) -> TaskTracker
    where
        H: Fn(Connection) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let sessions = TaskTracker::new();
        let local = self.listener.local_addr().ok();
        tracing::info!(
            "Listening on: tcp://{}{}",
            local.map_or_else(|| self.config.address(), |addr| addr.to_string()),
            if self.acceptor.is_some() { " (TLS)" } else { "" }
        );

        loop {
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (tcp, peer) = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::error!("Connection error: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };
            tracing::info!("Connection received: {}", peer);

            if let Err(e) = tune_accepted(&tcp, self.config.keepalive) {
                tracing::warn!("Failed to tune connection from {}: {}", peer, e);
            }

            let acceptor = self.acceptor.clone();
            let handshake_timeout = self.config.connect_timeout;
            let handler = handler.clone();
            sessions.spawn(async move {
                let _permit = permit;
                let conn = match acceptor {
                    Some(acceptor) => {
                        match handshake(&acceptor, tcp, peer, handshake_timeout).await {
                            Ok(conn) => conn,
                            Err(e) => {
                                tracing::warn!("{}", e);
                                return;
                            }
                        }
                    }
                    None => Connection::new(NetStream::Tcp(tcp), peer),
                };
                handler(conn).await;
            });

            if self.config.once {
                tracing::debug!("Once mode: not accepting further connections");
                break;
            }
        }

        drop(self.listener);
        sessions.close();
        tracing::info!("Listener closed, {} session(s) still running", sessions.len());
        sessions
    }
}

async fn handshake(
    acceptor: &TlsAcceptor,
    tcp: TcpStream,
    peer: SocketAddr,
    timeout: Duration,
) -> Result<Connection, HandshakeError> {
    let tls = match tokio::time::timeout(timeout, acceptor.accept(tcp)).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(source)) => return Err(HandshakeError { peer, source }),
        Err(_) => {
            return Err(HandshakeError {
                peer,
                source: io::Error::new(io::ErrorKind::TimedOut, "handshake timed out"),
            })
        }
    };
    tracing::debug!("✓ TLS handshake completed with {}", peer);
    Ok(Connection::new(NetStream::ServerTls(Box::new(tls)), peer))
}
