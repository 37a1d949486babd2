use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser};
use flycat_client::Dialer;
use flycat_common::{
    config::{
        Config, Mode, Protocol, RawConfig, DEFAULT_BUFFER_SIZE, DEFAULT_HOST,
        DEFAULT_MAX_CONNECTIONS, DEFAULT_PORT,
    },
    logging,
    platform::PlatformCapabilities,
    pump::InputMode,
    session::{spawn_shutdown_listener, SessionController, SessionOutcome},
    stream::Connection,
};
use flycat_server::{TcpServer, UdpServer};
use tokio_util::sync::CancellationToken;

/// Grace period for tasks still running when the process exits
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(name = "flycat", version)]
#[command(about = "Dial or listen on TCP/UDP, relay stdio or bridge a shell, optionally over TLS")]
#[command(disable_help_flag = true, allow_negative_numbers = true)]
struct Args {
    /// Listen instead of dialing
    #[arg(short = 'l', long)]
    listen: bool,

    /// Host to dial, or address to listen on
    #[arg(short = 'h', long, default_value = DEFAULT_HOST)]
    host: String,

    /// Port to dial or listen on
    #[arg(short = 'p', long, default_value_t = DEFAULT_PORT)]
    port: i64,

    /// Network protocol: tcp or udp
    #[arg(short = 'n', long = "network", default_value = "tcp")]
    protocol: String,

    /// Bridge the connection to a local shell instead of stdio
    #[arg(short = 'e', long = "exec")]
    shell: bool,

    /// Wrap TCP connections in TLS
    #[arg(long)]
    tls: bool,

    /// PEM roots the dialing side verifies the server against
    #[arg(long, value_name = "PEM")]
    tls_ca: Option<PathBuf>,

    /// PEM certificate chain served instead of an ephemeral one
    #[arg(long, value_name = "PEM", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// PEM private key for --tls-cert
    #[arg(long, value_name = "PEM", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Enable TCP keepalive probes
    #[arg(long)]
    keepalive: bool,

    /// Relay buffer size in bytes
    #[arg(short = 'b', long, default_value_t = DEFAULT_BUFFER_SIZE)]
    buffer_size: i64,

    /// Per-attempt connect timeout in seconds
    #[arg(short = 't', long = "timeout", default_value_t = 10)]
    connect_timeout: u64,

    /// Extra dial attempts after the first one fails
    #[arg(short = 'r', long, default_value_t = 0)]
    retries: i64,

    /// Linear backoff unit between dial attempts, in milliseconds
    #[arg(long, default_value_t = 1000)]
    retry_backoff_ms: u64,

    /// Kill a bridged shell after this many seconds
    #[arg(long, default_value_t = 3600)]
    shell_timeout: u64,

    /// Concurrent sessions served in TCP listen mode
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_connections: i64,

    /// Stop listening after the first connection
    #[arg(long)]
    once: bool,

    /// Verbose logging (pass `-v false` to quiet down)
    #[arg(
        short = 'v',
        long,
        default_value_t = true,
        num_args = 0..=1,
        default_missing_value = "true",
        action = ArgAction::Set
    )]
    verbose: bool,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,
}

impl Args {
    fn into_raw(self) -> RawConfig {
        RawConfig {
            protocol:        self.protocol,
            listen:          self.listen,
            host:            self.host,
            port:            self.port,
            shell:           self.shell,
            tls:             self.tls,
            keepalive:       self.keepalive,
            buffer_size:     self.buffer_size,
            connect_timeout: Duration::from_secs(self.connect_timeout),
            retries:         self.retries,
            retry_backoff:   Duration::from_millis(self.retry_backoff_ms),
            shell_timeout:   Duration::from_secs(self.shell_timeout),
            max_connections: self.max_connections,
            once:            self.once,
            tls_ca:          self.tls_ca,
            tls_cert:        self.tls_cert,
            tls_key:         self.tls_key,
            verbose:         self.verbose,
        }
    }
}

fn main() -> ExitCode {
    let raw = Args::parse().into_raw();
    logging::init(raw.verbose);

    match start(raw) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("flycat: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn start(raw: RawConfig) -> Result<()> {
    let config = Arc::new(Config::from_raw(raw).context("Invalid configuration")?);
    tracing::debug!("Configuration: {:?}", config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let result = runtime.block_on(run(config));
    // Session tasks still running after the main future are abandoned.
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
    result
}

async fn run(config: Arc<Config>) -> Result<()> {
    let (shutdown, _signals) = spawn_shutdown_listener();
    let caps = PlatformCapabilities::detect();
    tracing::debug!("Platform: {} (shell {})", caps.family, caps.shell);
    let controller = SessionController::new(config.clone(), caps, InputMode::detect());

    match (config.mode, config.protocol) {
        (Mode::Listen, Protocol::Tcp) => listen_tcp(controller, shutdown).await,
        (Mode::Listen, Protocol::Udp) => listen_udp(controller, shutdown).await,
        (Mode::Dial, _) => dial(controller, shutdown).await,
    }
}

async fn listen_tcp(controller: SessionController, shutdown: CancellationToken) -> Result<()> {
    let config = controller.config().clone();
    let server = TcpServer::bind(config.clone())
        .await
        .context("Failed to start listener")?;

    let handler = move |conn: Connection| {
        let controller = controller.clone();
        async move {
            controller.handle(conn).await;
        }
    };
    let sessions = server.serve(handler, shutdown.clone()).await;

    if config.once {
        tokio::select! {
            _ = sessions.wait() => {}
            _ = shutdown.cancelled() => {}
        }
    }
    Ok(())
}

async fn listen_udp(controller: SessionController, shutdown: CancellationToken) -> Result<()> {
    let server = UdpServer::bind(controller.config().clone(), controller.shell().clone())
        .await
        .context("Failed to start listener")?;
    server.serve(shutdown).await;
    Ok(())
}

async fn dial(controller: SessionController, shutdown: CancellationToken) -> Result<()> {
    let dialer = Dialer::new(controller.config().clone()).context("Failed to prepare TLS")?;

    let conn = tokio::select! {
        conn = dialer.dial() => conn?,
        _ = shutdown.cancelled() => return Ok(()),
    };

    tokio::select! {
        outcome = controller.handle(conn) => match outcome {
            SessionOutcome::Completed => Ok(()),
            SessionOutcome::Failed => Err(anyhow!("session ended with an error")),
        },
        _ = shutdown.cancelled() => Ok(()),
    }
}
