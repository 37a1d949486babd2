use std::{
    fmt, io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpStream, UdpSocket},
};
use uuid::Uuid;

use crate::config::Protocol;

/// Transport underneath a [`Connection`]
pub enum NetStream {
    /// Plain TCP
    Tcp(TcpStream),
    /// TCP with TLS, dialing side
    ClientTls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    /// TCP with TLS, accepting side
    ServerTls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    /// UDP socket connected to a single peer; one read or write is one
    /// datagram
    Udp(UdpSocket),
}

impl NetStream {
    pub fn protocol(&self) -> Protocol {
        match self {
            NetStream::Udp(_) => Protocol::Udp,
            _ => Protocol::Tcp,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, NetStream::ClientTls(_) | NetStream::ServerTls(_))
    }

    /// DER certificates the peer presented during the TLS handshake
    pub fn peer_certificates(&self) -> Option<&[rustls::pki_types::CertificateDer<'static>]> {
        match self {
            NetStream::ClientTls(tls) => tls.get_ref().1.peer_certificates(),
            NetStream::ServerTls(tls) => tls.get_ref().1.peer_certificates(),
            _ => None,
        }
    }
}

/// An open connection to one peer.
///
/// Reads and writes go straight to the transport. Dropping the value closes
/// it, so every exit path of whoever owns it releases the socket exactly once.
pub struct Connection {
    id:     Uuid,
    peer:   SocketAddr,
    stream: NetStream,
}

impl Connection {
    pub fn new(stream: NetStream, peer: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            stream,
        }
    }

    /// Identifier attached to this connection's log span
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream(&self) -> &NetStream {
        &self.stream
    }

    pub fn protocol(&self) -> Protocol {
        self.stream.protocol()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("protocol", &self.protocol())
            .field("tls", &self.stream.is_tls())
            .finish()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            NetStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            NetStream::ClientTls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            NetStream::ServerTls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            NetStream::Udp(socket) => socket.poll_recv(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().stream {
            NetStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            NetStream::ClientTls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            NetStream::ServerTls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            NetStream::Udp(socket) => socket.poll_send(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            NetStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            NetStream::ClientTls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            NetStream::ServerTls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            NetStream::Udp(_) => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            NetStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            NetStream::ClientTls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            NetStream::ServerTls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            // Connectionless; there is nothing to half-close.
            NetStream::Udp(_) => Poll::Ready(Ok(())),
        }
    }
}
