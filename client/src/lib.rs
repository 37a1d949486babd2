//! Dial side of flycat: a retrying TCP/UDP dialer with optional TLS.

pub mod dial;

pub use dial::{backoff_delay, Dialer};
