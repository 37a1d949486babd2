//! Listen side of flycat.
//!
//! [`TcpServer`] runs the accept loop: optional TLS with an identity made at
//! bind time, a cap on concurrent sessions, and shutdown through a
//! [`CancellationToken`](tokio_util::sync::CancellationToken).
//! [`UdpServer`] answers datagrams one at a time.

pub mod tcp;
pub mod udp;

pub use tcp::TcpServer;
pub use udp::UdpServer;
