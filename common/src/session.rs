use std::{io, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    config::{Config, Protocol, UDP_DATAGRAM_CEILING},
    input::LocalInput,
    platform::PlatformCapabilities,
    pump::{DuplexPump, InputMode},
    shell::ShellBridge,
    stream::Connection,
};

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Shell exited successfully or the relay drained cleanly
    Completed,
    /// The shell or relay failed; the connection was still closed
    Failed,
}

/// Per-connection orchestration: bridges a shell or pumps local stdio,
/// then releases the connection.
#[derive(Debug, Clone)]
pub struct SessionController {
    config:     Arc<Config>,
    shell:      ShellBridge,
    input_mode: InputMode,
}

impl SessionController {
    pub fn new(config: Arc<Config>, caps: PlatformCapabilities, input_mode: InputMode) -> Self {
        let shell = ShellBridge::new(caps, config.shell_timeout);
        Self {
            config,
            shell,
            input_mode,
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn shell(&self) -> &ShellBridge {
        &self.shell
    }

    /// Runs one session against the process's standard streams. Input comes
    /// from the shared [`LocalInput::stdin`] reader so consecutive sessions
    /// hand stdin over without losing bytes.
    pub async fn handle(&self, conn: Connection) -> SessionOutcome {
        self.handle_with(conn, LocalInput::stdin().reader(), tokio::io::stdout())
            .await
    }

    /// Runs one session; `input` and `output` stand in for local stdio when
    /// not in shell mode.
    pub async fn handle_with<I, O>(&self, conn: Connection, input: I, output: O) -> SessionOutcome
    where
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin + Send + 'static,
    {
        let span = tracing::info_span!("session", id = %conn.id(), peer = %conn.peer());
        self.dispatch(conn, input, output).instrument(span).await
    }

    async fn dispatch<I, O>(&self, conn: Connection, input: I, output: O) -> SessionOutcome
    where
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin + Send + 'static,
    {
        let peer = conn.peer();
        tracing::info!("Session started ({:?})", conn);

        let outcome = if self.config.shell {
            match self.shell.run(conn).await {
                Ok(_) => SessionOutcome::Completed,
                Err(e) => {
                    tracing::error!("Shell session failed: {}", e);
                    SessionOutcome::Failed
                }
            }
        } else {
            let buffer_size = match conn.protocol() {
                Protocol::Udp => self.config.buffer_size.max(UDP_DATAGRAM_CEILING),
                Protocol::Tcp => self.config.buffer_size,
            };
            match DuplexPump::new(buffer_size, self.input_mode)
                .run(conn, input, output)
                .await
            {
                Ok(stats) => {
                    tracing::info!(
                        "Relayed {} bytes in, {} bytes out",
                        stats.received,
                        stats.sent
                    );
                    SessionOutcome::Completed
                }
                Err(e) => {
                    tracing::error!("Relay failed: {}", e);
                    SessionOutcome::Failed
                }
            }
        };

        tracing::info!("Closed: {}", peer);
        outcome
    }
}

/// Spawns the process-wide shutdown listener. The returned token is
/// cancelled on the first termination signal.
pub fn spawn_shutdown_listener() -> (CancellationToken, JoinHandle<()>) {
    let token = CancellationToken::new();
    let trigger = token.clone();
    let handle = tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(name) => tracing::info!("Received {}, shutting down", name),
            Err(e) => tracing::error!("Signal listener failed, shutting down: {}", e),
        }
        trigger.cancel();
    });
    (token, handle)
}

#[cfg(unix)]
async fn wait_for_signal() -> io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    let name = tokio::select! {
        _ = hangup.recv() => "SIGHUP",
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = quit.recv() => "SIGQUIT",
    };
    Ok(name)
}

#[cfg(not(unix))]
async fn wait_for_signal() -> io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl+C")
}
