//! Stream decorator that turns a shell's legacy console encoding into UTF-8
//! on the way out to the peer.
//!
//! The child's stdout and stderr are both drained into the same adapter, so
//! writes and close are serialized under one lock. Interleaving between the
//! two output streams is therefore ordered by lock acquisition only, not by
//! which stream produced the bytes. Reads use the independent read half of
//! the connection so a pending read never holds up shell output.

use std::io;

use encoding_rs::{Decoder, Encoding};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::Mutex,
};

struct Outbound<S> {
    inner:   WriteHalf<S>,
    decoder: Option<Decoder>,
    closed:  bool,
}

/// Wraps a connection, transcoding outbound bytes when `encoding` is set.
pub struct EncodingAdapter<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<Outbound<S>>,
}

impl<S> EncodingAdapter<S>
where
    S: AsyncRead + AsyncWrite + Send,
{
    /// `encoding` is the legacy encoding outbound bytes are in; `None`
    /// passes them through untouched.
    pub fn new(stream: S, encoding: Option<&'static Encoding>) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(Outbound {
                inner:   writer,
                // BOM sniffing would misread legacy bytes that happen to look
                // like a UTF-16 BOM.
                decoder: encoding.map(|e| e.new_decoder_without_bom_handling()),
                closed:  false,
            }),
        }
    }

    /// Reads from the peer. Inbound bytes are never transcoded.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.lock().await.read(buf).await
    }

    /// Writes `buf` to the peer, transcoded if needed, and reports
    /// `buf.len()` regardless of how many bytes were actually sent.
    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.writer.lock().await;
        let out = &mut *guard;
        if out.closed {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "encoding adapter is closed",
            ));
        }

        match out.decoder.as_mut() {
            None => out.inner.write_all(buf).await?,
            Some(decoder) => {
                let utf8 = transcode(decoder, buf, false);
                if !utf8.is_empty() {
                    out.inner.write_all(utf8.as_bytes()).await?;
                }
            }
        }
        out.inner.flush().await?;
        Ok(buf.len())
    }

    /// Flushes any partially decoded character and shuts the write side down.
    /// Further writes fail; closing twice is a no-op.
    pub async fn close(&self) -> io::Result<()> {
        let mut guard = self.writer.lock().await;
        let out = &mut *guard;
        if out.closed {
            return Ok(());
        }
        out.closed = true;

        if let Some(decoder) = out.decoder.as_mut() {
            let tail = transcode(decoder, &[], true);
            if !tail.is_empty() {
                out.inner.write_all(tail.as_bytes()).await?;
            }
        }
        out.inner.shutdown().await
    }
}

/// Decodes one chunk, keeping incomplete trailing sequences inside the
/// decoder until the next chunk (or `last`) arrives.
fn transcode(decoder: &mut Decoder, input: &[u8], last: bool) -> String {
    let capacity = decoder
        .max_utf8_buffer_length(input.len())
        .unwrap_or(input.len() * 3 + 16);
    let mut out = String::with_capacity(capacity);
    let (_, _, had_errors) = decoder.decode_to_string(input, &mut out, last);
    if had_errors {
        tracing::debug!("Replaced undecodable console bytes while transcoding");
    }
    out
}
