use std::{process::ExitStatus, process::Stdio, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    process::{Child, Command},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{encoding::EncodingAdapter, error::ShellExecutionError, platform::PlatformCapabilities};

const PIPE_BUFFER_SIZE: usize = 8 * 1024;

/// How long output drains may keep running after the shell exits, to pick up
/// whatever is still buffered in the pipes.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Runs a platform shell with its standard streams wired to a remote peer.
#[derive(Debug, Clone)]
pub struct ShellBridge {
    caps:    PlatformCapabilities,
    timeout: Duration,
}

impl ShellBridge {
    pub fn new(caps: PlatformCapabilities, timeout: Duration) -> Self {
        Self { caps, timeout }
    }

    pub fn shell(&self) -> &'static str {
        self.caps.shell
    }

    /// Bridges one interactive shell to `conn` until the shell exits, is
    /// killed on timeout, or the peer goes away. The connection is closed on
    /// every path.
    pub async fn run<S>(&self, conn: S) -> Result<ExitStatus, ShellExecutionError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let adapter = Arc::new(EncodingAdapter::new(conn, self.caps.legacy_encoding));
        let result = self.bridge(&adapter).await;
        if let Err(e) = adapter.close().await {
            tracing::debug!("Closing shell connection: {}", e);
        }
        result
    }

    async fn bridge<S>(
        &self,
        adapter: &Arc<EncodingAdapter<S>>,
    ) -> Result<ExitStatus, ShellExecutionError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let shell = self.caps.shell;
        let mut child = Command::new(shell)
            .args(self.caps.shell_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ShellExecutionError::Spawn {
                shell: shell.to_string(),
                source,
            })?;
        tracing::info!("Spawned {} (pid {:?})", shell, child.id());

        let peer_gone = CancellationToken::new();
        let feeder = child
            .stdin
            .take()
            .map(|stdin| tokio::spawn(feed_stdin(adapter.clone(), stdin)));
        let drains: Vec<JoinHandle<()>> = [
            child.stdout.take().map(|out| spawn_drain(adapter.clone(), out, peer_gone.clone())),
            child.stderr.take().map(|err| spawn_drain(adapter.clone(), err, peer_gone.clone())),
        ]
        .into_iter()
        .flatten()
        .collect();

        let outcome = tokio::select! {
            status = child.wait() => status.map_err(|source| ShellExecutionError::Wait {
                shell: shell.to_string(),
                source,
            }),
            _ = tokio::time::sleep(self.timeout) => {
                tracing::warn!("Shell session exceeded {:?}, killing {}", self.timeout, shell);
                kill(&mut child).await;
                Err(ShellExecutionError::TimedOut {
                    shell:   shell.to_string(),
                    timeout: self.timeout,
                })
            }
            _ = peer_gone.cancelled() => {
                tracing::info!("Peer stopped accepting output, killing {}", shell);
                kill(&mut child).await;
                child.wait().await.map_err(|source| ShellExecutionError::Wait {
                    shell: shell.to_string(),
                    source,
                })
            }
        };

        // A background job can hold a pipe open past the shell's exit; its
        // drain is aborted so the adapter, and the connection, are released.
        let deadline = tokio::time::Instant::now() + DRAIN_GRACE;
        for mut drain in drains {
            if tokio::time::timeout_at(deadline, &mut drain).await.is_err() {
                tracing::debug!("Output pipe still open after shell exit, abandoning it");
                drain.abort();
                let _ = drain.await;
            }
        }
        if let Some(feeder) = feeder {
            feeder.abort();
            let _ = feeder.await;
        }

        let status = outcome?;
        tracing::info!("{} exited with {}", shell, status);
        if status.success() {
            Ok(status)
        } else {
            Err(ShellExecutionError::NonZeroExit {
                shell: shell.to_string(),
                status,
            })
        }
    }

    /// Runs `command` to completion through the shell's one-shot flag and
    /// returns stdout followed by stderr, plus the failure text if the command
    /// could not run or exited unsuccessfully.
    pub async fn run_command(&self, command: &str) -> Vec<u8> {
        let shell = self.caps.shell;
        let output = Command::new(shell)
            .arg(self.caps.command_flag)
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let mut reply = Vec::new();
        let failure = match tokio::time::timeout(self.timeout, output).await {
            Ok(Ok(output)) => {
                reply.extend_from_slice(&output.stdout);
                reply.extend_from_slice(&output.stderr);
                (!output.status.success()).then(|| ShellExecutionError::NonZeroExit {
                    shell:  shell.to_string(),
                    status: output.status,
                })
            }
            Ok(Err(source)) => Some(ShellExecutionError::Spawn {
                shell: shell.to_string(),
                source,
            }),
            Err(_) => Some(ShellExecutionError::TimedOut {
                shell:   shell.to_string(),
                timeout: self.timeout,
            }),
        };

        if let Some(encoding) = self.caps.legacy_encoding {
            let (utf8, _) = encoding.decode_without_bom_handling(&reply);
            reply = utf8.into_owned().into_bytes();
        }
        if let Some(e) = failure {
            tracing::warn!("Command {:?} failed: {}", command, e);
            reply.extend_from_slice(e.to_string().as_bytes());
        }
        reply
    }
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        tracing::warn!("Failed to kill shell: {}", e);
    }
}

/// Peer to shell stdin. Ends when the peer half-closes or the shell stops
/// reading; dropping stdin then gives the shell end-of-file.
async fn feed_stdin<S, W>(adapter: Arc<EncodingAdapter<S>>, mut stdin: W)
where
    S: AsyncRead + AsyncWrite + Send,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PIPE_BUFFER_SIZE];
    loop {
        match adapter.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!("Peer closed its input");
                break;
            }
            Ok(n) => {
                if let Err(e) = stdin.write_all(&buf[..n]).await {
                    tracing::debug!("Shell stdin closed: {}", e);
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("Reading from peer failed: {}", e);
                break;
            }
        }
    }
}

fn spawn_drain<S, R>(
    adapter: Arc<EncodingAdapter<S>>,
    pipe: R,
    peer_gone: CancellationToken,
) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(drain_output(adapter, pipe, peer_gone))
}

/// Shell stdout or stderr to peer.
async fn drain_output<S, R>(
    adapter: Arc<EncodingAdapter<S>>,
    mut pipe: R,
    peer_gone: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send,
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; PIPE_BUFFER_SIZE];
    loop {
        let n = match pipe.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("Shell output pipe failed: {}", e);
                return;
            }
        };
        if let Err(e) = adapter.write(&buf[..n]).await {
            tracing::debug!("Writing shell output to peer failed: {}", e);
            peer_gone.cancel();
            return;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Instant;

    use tokio::io::duplex;

    use super::*;

    fn posix(timeout: Duration) -> ShellBridge {
        ShellBridge::new(PlatformCapabilities::for_family("posix").unwrap(), timeout)
    }

    async fn session(
        bridge: ShellBridge,
        script: &'static [u8],
    ) -> (Result<ExitStatus, ShellExecutionError>, String) {
        let (conn, mut peer) = duplex(4096);
        let handle = tokio::spawn(async move { bridge.run(conn).await });
        peer.write_all(script).await.unwrap();
        let mut transcript = Vec::new();
        peer.read_to_end(&mut transcript).await.unwrap();
        (handle.await.unwrap(), String::from_utf8_lossy(&transcript).into_owned())
    }

    #[tokio::test]
    async fn commands_run_and_output_reaches_peer() {
        let (result, transcript) =
            session(posix(Duration::from_secs(30)), b"echo hello\necho oops 1>&2\nexit\n").await;
        assert!(result.unwrap().success());
        assert!(transcript.contains("hello"));
        assert!(transcript.contains("oops"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported() {
        let (result, _) = session(posix(Duration::from_secs(30)), b"exit 3\n").await;
        match result {
            Err(ShellExecutionError::NonZeroExit { status, .. }) => {
                assert_eq!(status.code(), Some(3))
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_kills_shell_and_closes_connection() {
        let started = Instant::now();
        let (result, _) = session(posix(Duration::from_millis(300)), b"sleep 30\n").await;
        assert!(matches!(result, Err(ShellExecutionError::TimedOut { .. })));
        assert!(started.elapsed() < Duration::from_secs(15));
    }

    #[tokio::test]
    async fn spawn_failure_still_closes_connection() {
        let caps = PlatformCapabilities {
            shell: "/nonexistent/flycat-shell",
            ..PlatformCapabilities::for_family("posix").unwrap()
        };
        let bridge = ShellBridge::new(caps, Duration::from_secs(5));
        let (result, transcript) = session(bridge, b"").await;
        assert!(matches!(result, Err(ShellExecutionError::Spawn { .. })));
        assert!(transcript.is_empty());
    }

    #[tokio::test]
    async fn peer_hangup_ends_shell() {
        let (conn, peer) = duplex(1024);
        drop(peer);
        let result = posix(Duration::from_secs(30)).run(conn).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn background_job_does_not_keep_connection_open() {
        let (conn, mut peer) = duplex(4096);
        let bridge = posix(Duration::from_secs(30));
        let handle = tokio::spawn(async move { bridge.run(conn).await });
        peer.write_all(b"sleep 10 &\nexit\n").await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(8), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(peer.write_all(b"echo late\n").await.is_err());
    }

    #[tokio::test]
    async fn one_shot_command_output_is_transcoded() {
        let caps = PlatformCapabilities {
            legacy_encoding: Some(encoding_rs::GBK),
            ..PlatformCapabilities::for_family("posix").unwrap()
        };
        let bridge = ShellBridge::new(caps, Duration::from_secs(10));
        let reply = bridge.run_command("printf '\\304\\343'").await;
        assert_eq!(String::from_utf8(reply).unwrap(), "你");
    }

    #[tokio::test]
    async fn one_shot_command_combines_output() {
        let bridge = posix(Duration::from_secs(10));
        assert_eq!(bridge.run_command("echo ok").await, b"ok\n");

        let reply = bridge.run_command("echo out; echo err 1>&2; exit 2").await;
        let reply = String::from_utf8(reply).unwrap();
        assert!(reply.starts_with("out\nerr\n"));
        assert!(reply.contains("exit status: 2"));
    }

    #[tokio::test]
    async fn one_shot_command_times_out() {
        let bridge = posix(Duration::from_millis(200));
        let reply = String::from_utf8(bridge.run_command("sleep 30").await).unwrap();
        assert!(reply.contains("session timeout"));
    }
}
