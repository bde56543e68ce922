//! Tracing initialization for embedding processes.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::LoggingConfig;

const DEFAULT_FILTER: &str = "boxraffle=info";

/// Install a global subscriber honoring the configured filter, falling back
/// to `RUST_LOG`, then the crate default. Safe to call once per process;
/// repeated calls are ignored.
pub fn init(config: &LoggingConfig) {
    let filter = match &config.filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
    };
    let _ = Registry::default()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
