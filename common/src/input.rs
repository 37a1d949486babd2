//! Process-wide local input.
//!
//! Standard input is read by one dedicated thread for the life of the
//! process and handed out in chunks through a channel. Sessions take readers
//! on that channel instead of opening their own stdin handle, so a session
//! that ends while a read is pending does not swallow what is typed next:
//! unread chunks stay queued for the following session.

use std::{
    io::{self, Read},
    pin::Pin,
    sync::{Arc, Mutex, OnceLock, PoisonError},
    task::{Context, Poll},
    thread,
};

use tokio::{
    io::{AsyncRead, ReadBuf},
    sync::mpsc,
};

const CHUNK_SIZE: usize = 8 * 1024;
const QUEUED_CHUNKS: usize = 16;

type Chunks = Arc<Mutex<mpsc::Receiver<Vec<u8>>>>;

/// Shared source of local input bytes.
#[derive(Debug, Clone)]
pub struct LocalInput {
    chunks: Chunks,
}

impl LocalInput {
    /// The process's standard input. The reader thread starts on first use.
    pub fn stdin() -> Self {
        static STDIN: OnceLock<LocalInput> = OnceLock::new();
        STDIN.get_or_init(|| Self::spawn("flycat-stdin", io::stdin())).clone()
    }

    /// Starts a thread draining `source` into the shared queue. End of input
    /// or a read error closes the queue; readers then see end of stream.
    pub fn spawn<R>(name: &str, mut source: R) -> Self
    where
        R: Read + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(QUEUED_CHUNKS);
        let spawned = thread::Builder::new().name(name.to_string()).spawn(move || {
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                let n = match source.read(&mut buf) {
                    Ok(0) => {
                        tracing::debug!("Local input reached end of stream");
                        return;
                    }
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::warn!("Reading local input failed: {}", e);
                        return;
                    }
                };
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    return;
                }
            }
        });
        if let Err(e) = spawned {
            // The sender went down with the closure; readers see end of stream.
            tracing::error!("Failed to start local input reader: {}", e);
        }

        Self {
            chunks: Arc::new(Mutex::new(rx)),
        }
    }

    pub fn reader(&self) -> InputReader {
        InputReader {
            chunks:  self.chunks.clone(),
            pending: Vec::new(),
            offset:  0,
        }
    }
}

/// One session's view of a [`LocalInput`].
///
/// Concurrent readers compete for chunks; each chunk goes to exactly one of
/// them.
#[derive(Debug)]
pub struct InputReader {
    chunks:  Chunks,
    pending: Vec<u8>,
    offset:  usize,
}

impl AsyncRead for InputReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.offset >= this.pending.len() {
            let polled = this
                .chunks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .poll_recv(cx);
            match polled {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Ready(Some(chunk)) => {
                    this.pending = chunk;
                    this.offset = 0;
                }
            }
        }

        let n = buf.remaining().min(this.pending.len() - this.offset);
        buf.put_slice(&this.pending[this.offset..this.offset + n]);
        this.offset += n;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc as std_mpsc, time::Duration};

    use tokio::io::AsyncReadExt;

    use super::*;

    /// Blocking source fed line by line, like a terminal.
    struct Typed(std_mpsc::Receiver<Vec<u8>>);

    impl Read for Typed {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.recv() {
                Ok(line) => {
                    buf[..line.len()].copy_from_slice(&line);
                    Ok(line.len())
                }
                Err(_) => Ok(0),
            }
        }
    }

    #[tokio::test]
    async fn abandoned_read_does_not_lose_later_input() {
        let (keys, typed) = std_mpsc::channel();
        let input = LocalInput::spawn("typed-input", Typed(typed));

        let mut first = input.reader();
        let mut buf = [0u8; 64];
        let idle = Duration::from_millis(100);
        assert!(tokio::time::timeout(idle, first.read(&mut buf)).await.is_err());
        drop(first);

        keys.send(b"hello\n".to_vec()).unwrap();
        let mut second = input.reader();
        let n = tokio::time::timeout(Duration::from_secs(5), second.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"hello\n");
    }

    #[tokio::test]
    async fn end_of_input_reaches_every_reader() {
        let input = LocalInput::spawn("cursor-input", io::Cursor::new(b"all of it".to_vec()));

        let mut got = Vec::new();
        input.reader().read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"all of it");

        let mut later = Vec::new();
        input.reader().read_to_end(&mut later).await.unwrap();
        assert!(later.is_empty());
    }

    #[tokio::test]
    async fn small_buffers_get_the_whole_chunk() {
        let input = LocalInput::spawn("cursor-input", io::Cursor::new(b"abcdef".to_vec()));
        let mut reader = input.reader();
        let mut buf = [0u8; 4];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ef");
    }
}
