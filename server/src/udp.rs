use std::{io, net::SocketAddr, sync::Arc};

use flycat_common::{
    config::{Config, UDP_DATAGRAM_CEILING},
    error::{ConfigError, ListenSetupError},
    shell::ShellBridge,
};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    net::UdpSocket,
};
use tokio_util::sync::CancellationToken;

/// Largest payload that fits in a single IPv4 UDP datagram
const MAX_REPLY: usize = 65_507;

/// Connectionless listener. Every datagram is handled on its own: run as a
/// shell command in shell mode, otherwise echoed back and shown locally.
pub struct UdpServer {
    socket: UdpSocket,
    config: Arc<Config>,
    shell:  ShellBridge,
}

impl UdpServer {
    pub async fn bind(config: Arc<Config>, shell: ShellBridge) -> Result<Self, ListenSetupError> {
        if config.tls {
            return Err(ConfigError::TlsOverUdp.into());
        }
        let addr = config.address();
        let socket = UdpSocket::bind(&addr)
            .await
            .map_err(|source| ListenSetupError::Bind { addr, source })?;
        Self::from_socket(socket, config, shell)
    }

    pub fn from_socket(
        socket: UdpSocket,
        config: Arc<Config>,
        shell: ShellBridge,
    ) -> Result<Self, ListenSetupError> {
        if config.tls {
            return Err(ConfigError::TlsOverUdp.into());
        }
        Ok(Self {
            socket,
            config,
            shell,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serves until `shutdown` fires, echoing to standard output.
    pub async fn serve(self, shutdown: CancellationToken) {
        self.serve_with(shutdown, tokio::io::stdout()).await
    }

    /// Serves until `shutdown` fires. `output` receives the payloads shown
    /// locally in echo mode.
    pub async fn serve_with<O>(self, shutdown: CancellationToken, mut output: O)
    where
        O: AsyncWrite + Unpin,
    {
        if let Ok(addr) = self.socket.local_addr() {
            tracing::info!("Listening on: udp://{}", addr);
        }

        let mut buf = vec![0u8; UDP_DATAGRAM_CEILING];
        loop {
            let (n, from) = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        // ICMP errors from earlier replies surface here.
                        tracing::warn!("Receive failed: {}", e);
                        continue;
                    }
                },
            };
            if n == 0 {
                tracing::debug!("Ignoring empty datagram from {}", from);
                continue;
            }
            tracing::info!("Datagram received: {} ({} bytes)", from, n);

            let payload = &buf[..n];
            if self.config.shell {
                self.execute(payload, from).await;
            } else {
                self.echo(payload, from, &mut output).await;
            }
        }

        tracing::info!("Closed udp listen");
    }

    async fn execute(&self, payload: &[u8], from: SocketAddr) {
        let command = String::from_utf8_lossy(payload);
        let command = command.trim();
        if command.is_empty() {
            tracing::debug!("Ignoring blank command from {}", from);
            return;
        }

        tracing::info!("Executing {:?} for {}", command, from);
        let mut reply = self.shell.run_command(command).await;
        if reply.len() > MAX_REPLY {
            tracing::warn!(
                "Reply of {} bytes truncated to {} for {}",
                reply.len(),
                MAX_REPLY,
                from
            );
            reply.truncate(MAX_REPLY);
        }
        self.send(&reply, from).await;
    }

    async fn echo<O>(&self, payload: &[u8], from: SocketAddr, output: &mut O)
    where
        O: AsyncWrite + Unpin,
    {
        self.send(payload, from).await;
        let shown = async {
            output.write_all(payload).await?;
            output.flush().await
        };
        if let Err(e) = shown.await {
            tracing::warn!("Failed to write datagram locally: {}", e);
        }
    }

    async fn send(&self, reply: &[u8], to: SocketAddr) {
        if let Err(e) = self.socket.send_to(reply, to).await {
            tracing::warn!("Failed to reply to {}: {}", to, e);
        }
    }
}
