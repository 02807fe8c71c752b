//! Logging setup
//!
//! The library itself only emits `tracing` events. Binaries and tests that
//! want to see them call [`init_logging`] once.

use runlink_config::Config;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding the log filter
pub const LOG_ENV: &str = "RUNLINK_LOG";

const DEFAULT_FILTER: &str = "runlink=info";

/// Install a compact fmt subscriber filtered by `RUNLINK_LOG`
///
/// Does nothing if a global subscriber is already installed.
pub fn init_logging() {
    init_logging_with(None);
}

/// Like [`init_logging`], falling back to the configured filter
pub fn init_logging_from(config: &Config) {
    init_logging_with(config.log_filter());
}

/// Install the subscriber with `fallback` used when `RUNLINK_LOG` is unset
pub fn init_logging_with(fallback: Option<&str>) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(fallback.unwrap_or(DEFAULT_FILTER)))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    fmt()
        .with_env_filter(filter)
        .compact()
        .try_init()
        .ok(); // already initialized
}
