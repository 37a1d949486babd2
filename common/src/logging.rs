use tracing_subscriber::EnvFilter;

use crate::config::LOG_FILTER_ENV;

/// Installs the global subscriber. Logs go to stderr since stdout carries
/// relayed data. `FLYCAT_LOG` overrides the level chosen by `verbose`.
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
