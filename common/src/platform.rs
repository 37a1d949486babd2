//! Per-platform behaviour resolved once at startup: which shell to run, how to
//! pass it a single command, and whether its console output needs
//! transcoding. Also TCP socket tuning.

use std::{io, time::Duration};

use encoding_rs::Encoding;
use tokio::net::TcpStream;

use crate::config::KEEPALIVE_INTERVAL;

/// Shell and console facts for one platform family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformCapabilities {
    /// Human readable family name, used in logs
    pub family:          &'static str,
    /// Interpreter spawned for interactive sessions
    pub shell:           &'static str,
    /// Arguments for an interactive session
    pub shell_args:      &'static [&'static str],
    /// Flag that makes the shell run one command string and exit
    pub command_flag:    &'static str,
    /// Legacy console encoding whose output must become UTF-8, if any
    pub legacy_encoding: Option<&'static Encoding>,
}

const POSIX: PlatformCapabilities = PlatformCapabilities {
    family:          "posix",
    shell:           "/bin/sh",
    shell_args:      &[],
    command_flag:    "-c",
    legacy_encoding: None,
};

const FREEBSD: PlatformCapabilities = PlatformCapabilities {
    family:          "freebsd",
    shell:           "/bin/csh",
    shell_args:      &[],
    command_flag:    "-c",
    legacy_encoding: None,
};

const WINDOWS: PlatformCapabilities = PlatformCapabilities {
    family:          "windows",
    shell:           "cmd.exe",
    shell_args:      &[],
    command_flag:    "/C",
    legacy_encoding: Some(encoding_rs::GBK),
};

impl PlatformCapabilities {
    /// Capabilities of the platform this binary was built for.
    pub fn detect() -> Self {
        if cfg!(windows) {
            Self {
                legacy_encoding: console_encoding(),
                ..WINDOWS
            }
        } else if cfg!(target_os = "freebsd") {
            FREEBSD
        } else {
            POSIX
        }
    }

    /// Table entry for a family name, independent of the host platform.
    pub fn for_family(family: &str) -> Option<Self> {
        [POSIX, FREEBSD, WINDOWS]
            .into_iter()
            .find(|caps| caps.family == family)
    }

    pub fn needs_transcoding(&self) -> bool {
        self.legacy_encoding.is_some()
    }
}

/// Maps a Windows code page to the encoding its console output uses.
/// `None` means the console already emits UTF-8.
pub fn encoding_for_code_page(code_page: u32) -> Option<&'static Encoding> {
    match code_page {
        65001 => None,
        936 => Some(encoding_rs::GBK),
        950 => Some(encoding_rs::BIG5),
        932 => Some(encoding_rs::SHIFT_JIS),
        949 => Some(encoding_rs::EUC_KR),
        866 => Some(encoding_rs::IBM866),
        1251 => Some(encoding_rs::WINDOWS_1251),
        1252 => Some(encoding_rs::WINDOWS_1252),
        _ => Some(encoding_rs::GBK),
    }
}

#[cfg(windows)]
fn console_encoding() -> Option<&'static Encoding> {
    // SAFETY: GetConsoleOutputCP takes no arguments and only reads process
    // console state. It returns 0 when there is no console.
    let code_page = unsafe { windows::Win32::System::Console::GetConsoleOutputCP() };
    tracing::debug!("Console output code page: {}", code_page);
    encoding_for_code_page(code_page)
}

#[cfg(not(windows))]
fn console_encoding() -> Option<&'static Encoding> {
    None
}

/// Tunes a dialed connection: zero linger so close resets instead of
/// lingering, plus [`tune_accepted`].
pub fn tune_tcp(stream: &TcpStream, keepalive: bool) -> io::Result<()> {
    stream.set_linger(Some(Duration::ZERO))?;
    tune_accepted(stream, keepalive)
}

/// Tunes an accepted connection: nodelay and optional keepalive probing.
/// Linger stays at the system default so replies written just before close
/// still reach the peer.
pub fn tune_accepted(stream: &TcpStream, keepalive: bool) -> io::Result<()> {
    stream.set_nodelay(true)?;
    if keepalive {
        set_keepalive(stream, KEEPALIVE_INTERVAL)?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_keepalive(stream: &TcpStream, interval: Duration) -> io::Result<()> {
    use nix::sys::socket::{setsockopt, sockopt};

    setsockopt(stream, sockopt::KeepAlive, &true).map_err(io::Error::from)?;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let secs = interval.as_secs().max(1) as u32;
        setsockopt(stream, sockopt::TcpKeepIdle, &secs).map_err(io::Error::from)?;
        setsockopt(stream, sockopt::TcpKeepInterval, &secs).map_err(io::Error::from)?;
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    tracing::debug!(
        "Keepalive enabled with system default timing (requested {:?})",
        interval
    );

    Ok(())
}

#[cfg(not(unix))]
fn set_keepalive(_stream: &TcpStream, interval: Duration) -> io::Result<()> {
    tracing::warn!(
        "Keepalive tuning ({:?}) is not available on this platform",
        interval
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_windows_transcodes() {
        assert!(!PlatformCapabilities::for_family("posix").unwrap().needs_transcoding());
        assert!(!PlatformCapabilities::for_family("freebsd").unwrap().needs_transcoding());
        assert!(PlatformCapabilities::for_family("windows").unwrap().needs_transcoding());
        assert!(PlatformCapabilities::for_family("plan9").is_none());
    }

    #[test]
    fn shells_per_family() {
        assert_eq!(PlatformCapabilities::for_family("posix").unwrap().shell, "/bin/sh");
        assert_eq!(PlatformCapabilities::for_family("freebsd").unwrap().shell, "/bin/csh");
        let windows = PlatformCapabilities::for_family("windows").unwrap();
        assert_eq!(windows.shell, "cmd.exe");
        assert_eq!(windows.command_flag, "/C");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn linux_detects_posix() {
        assert_eq!(PlatformCapabilities::detect(), POSIX);
    }

    #[test]
    fn code_pages() {
        assert_eq!(encoding_for_code_page(65001), None);
        assert_eq!(encoding_for_code_page(936), Some(encoding_rs::GBK));
        assert_eq!(encoding_for_code_page(932), Some(encoding_rs::SHIFT_JIS));
        assert_eq!(encoding_for_code_page(0), Some(encoding_rs::GBK));
    }

    #[tokio::test]
    async fn tuning_applies_to_live_sockets() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let client = client.unwrap();
        let (_server, _) = accepted.unwrap();

        tune_tcp(&client, true).unwrap();
        assert_eq!(client.linger().unwrap(), Some(Duration::ZERO));
        assert!(client.nodelay().unwrap());
    }

    #[tokio::test]
    async fn accepted_sockets_keep_default_linger() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let _client = client.unwrap();
        let (server, _) = accepted.unwrap();

        tune_accepted(&server, true).unwrap();
        assert_eq!(server.linger().unwrap(), None);
        assert!(server.nodelay().unwrap());
    }
}
