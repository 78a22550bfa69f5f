//! Tracing subscriber bootstrap
//!
//! Library code only emits `tracing` events; binaries and test harnesses call
//! [`init`] once to decide where they go.

use crate::runtime_config::LoggingSettings;
use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber; `RUST_LOG` overrides the configured level
pub fn init(settings: &LoggingSettings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .map_err(|e| anyhow!("invalid log level '{}': {}", settings.level, e))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_thread_names(true);
    let installed = if settings.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow!("failed to install tracing subscriber: {}", e))
}

/// Best-effort subscriber for tests; output is captured per test
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()),
        ))
        .with_test_writer()
        .try_init();
}
