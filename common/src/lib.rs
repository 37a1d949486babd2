//! flycat connection engine
//!
//! This crate holds everything the flycat listener and dialer share:
//!
//! - Validated, immutable configuration
//! - The [`Connection`] type over plain TCP, TLS or connected UDP
//! - TLS configuration and the listener's ephemeral certificate
//! - The duplex relay between a connection and local stdio
//! - The shell bridge and its output transcoding adapter
//! - Per-connection session dispatch and the process-wide shutdown trigger
//!
//! # Features
//!
//! - **Ephemeral TLS**: a self-signed identity generated in memory at startup
//! - **Shell bridging**: a platform shell driven by the remote peer
//! - **Half-close aware relay**: local EOF reaches the peer without cutting off
//!   its replies

/// Configuration and validation
pub mod config;

/// Error taxonomy
pub mod error;

/// Platform capability table and socket tuning
pub mod platform;

/// Connection type over TCP, TLS and UDP
pub mod stream;

/// Listener identities
pub mod certificate;

/// rustls client and server configuration
pub mod tls;

/// Outbound console transcoding
pub mod encoding;

/// Process-wide standard input
pub mod input;

/// Connection <-> stdio relay
pub mod pump;

/// Shell bridging
pub mod shell;

/// Session dispatch and shutdown
pub mod session;

/// Subscriber setup
pub mod logging;

// Re-export commonly used types for convenience
pub use certificate::{CertificateProvider, TlsIdentity};
pub use config::{Config, Mode, Protocol, RawConfig, TlsTrust};
pub use input::LocalInput;
pub use platform::PlatformCapabilities;
pub use pump::{DuplexPump, InputMode};
pub use session::{spawn_shutdown_listener, SessionController, SessionOutcome};
pub use shell::ShellBridge;
pub use stream::{Connection, NetStream};
