//! Full-duplex relay between a connection and local input/output.
//!
//! The two directions run independently. Inbound (connection to local
//! output) runs on its own task and decides when the session is over: once
//! the peer closes or the read fails, the pump returns and whatever the
//! outbound direction is still waiting on is dropped. Outbound (local input to
//! connection) half-closes the connection when input is exhausted so the peer
//! sees end-of-stream while its replies keep flowing back.

use std::io::IsTerminal;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};

use crate::error::TransferError;

/// How local input is consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    /// A terminal: forward line by line, each terminated with `\n`
    Interactive,
    /// Redirected or piped: read everything, send it as one block
    Batch,
}

impl InputMode {
    /// Inspects the process's standard input.
    pub fn detect() -> Self {
        if std::io::stdin().is_terminal() {
            Self::Interactive
        } else {
            Self::Batch
        }
    }
}

/// Bytes moved in each direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    /// Connection to local output
    pub received: u64,
    /// Local input to connection
    pub sent:     u64,
}

/// Relays bytes between one connection and a local input/output pair.
#[derive(Debug, Clone, Copy)]
pub struct DuplexPump {
    buffer_size: usize,
    input_mode:  InputMode,
}

impl DuplexPump {
    pub fn new(buffer_size: usize, input_mode: InputMode) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            input_mode,
        }
    }

    /// Runs until the connection's inbound direction ends. The connection is
    /// fully released when this returns.
    pub async fn run<S, I, O>(
        &self,
        conn: S,
        input: I,
        output: O,
    ) -> Result<PumpStats, TransferError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(conn);
        let mut inbound = tokio::spawn(inbound(reader, output, self.buffer_size));

        let outbound = outbound(writer, input, self.input_mode);
        tokio::pin!(outbound);

        let mut stats = PumpStats::default();
        let mut outbound_done = false;

        let received = loop {
            tokio::select! {
                joined = &mut inbound => {
                    break match joined {
                        Ok(result) => result,
                        Err(e) => {
                            tracing::error!("Inbound relay task failed: {}", e);
                            Ok(0)
                        }
                    };
                }
                sent = &mut outbound, if !outbound_done => {
                    outbound_done = true;
                    match sent {
                        Ok(sent) => {
                            tracing::debug!("Local input finished after {} bytes", sent);
                            stats.sent = sent;
                        }
                        Err(e) => tracing::warn!("Outbound relay stopped: {}", e),
                    }
                }
            }
        };

        if !outbound_done {
            tracing::debug!("Connection closed before local input ended");
        }
        stats.received = received?;
        Ok(stats)
    }
}

async fn inbound<R, O>(
    mut reader: R,
    mut output: O,
    buffer_size: usize,
) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut total = 0u64;
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(TransferError::ConnectionRead)?;
        if n == 0 {
            tracing::debug!("Connection reached end of stream");
            return Ok(total);
        }
        output
            .write_all(&buf[..n])
            .await
            .map_err(TransferError::LocalWrite)?;
        output.flush().await.map_err(TransferError::LocalWrite)?;
        total += n as u64;
    }
}

async fn outbound<W, I>(mut writer: W, input: I, mode: InputMode) -> Result<u64, TransferError>
where
    W: AsyncWrite + Unpin,
    I: AsyncRead + Unpin,
{
    let mut sent = 0u64;
    match mode {
        InputMode::Batch => {
            let mut input = input;
            let mut block = Vec::new();
            input
                .read_to_end(&mut block)
                .await
                .map_err(TransferError::LocalRead)?;
            writer
                .write_all(&block)
                .await
                .map_err(TransferError::ConnectionWrite)?;
            sent += block.len() as u64;
        }
        InputMode::Interactive => {
            // Byte oriented: console input need not be UTF-8.
            let mut input = BufReader::new(input);
            let mut line = Vec::new();
            loop {
                line.clear();
                let n = input
                    .read_until(b'\n', &mut line)
                    .await
                    .map_err(TransferError::LocalRead)?;
                if n == 0 {
                    break;
                }
                if line.last() == Some(&b'\n') {
                    line.pop();
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                }
                line.push(b'\n');
                writer
                    .write_all(&line)
                    .await
                    .map_err(TransferError::ConnectionWrite)?;
                sent += line.len() as u64;
            }
        }
    }
    writer.flush().await.map_err(TransferError::ConnectionWrite)?;
    writer
        .shutdown()
        .await
        .map_err(TransferError::ConnectionWrite)?;
    Ok(sent)
}
