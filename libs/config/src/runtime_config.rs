//! Runtime Configuration Module
//!
//! Loads runtime settings from an optional TOML file with environment
//! variable overrides (`LOOPER_<SECTION>__<KEY>`, e.g.
//! `LOOPER_OBSERVER__NOTICE_TIMEOUT_MS=10`). Every field has a default, so an
//! absent file yields [`RuntimeConfig::default`].

use crate::defaults;
use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

static GLOBAL: OnceCell<RuntimeConfig> = OnceCell::new();

/// Complete runtime configuration
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub looper: LooperSettings,
    pub messenger: MessengerSettings,
    pub observer: ObserverSettings,
    pub logging: LoggingSettings,
}

/// Dispatch thread and queue settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct LooperSettings {
    pub thread_name_prefix: String,
    /// `None` leaves the queue unbounded
    pub queue_capacity: Option<usize>,
    pub idle_wait_ms: u64,
}

/// Messenger send/reply timeouts
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct MessengerSettings {
    pub reply_timeout_ms: Option<u64>,
    pub delivery_timeout_ms: Option<u64>,
}

/// Observer notification settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ObserverSettings {
    pub notice_timeout_ms: u64,
}

/// Logging settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LooperSettings {
    fn default() -> Self {
        Self {
            thread_name_prefix: defaults::looper::THREAD_NAME_PREFIX.to_string(),
            queue_capacity: None,
            idle_wait_ms: defaults::looper::IDLE_WAIT_MS,
        }
    }
}

impl Default for MessengerSettings {
    fn default() -> Self {
        Self {
            reply_timeout_ms: defaults::messenger::REPLY_TIMEOUT_MS,
            delivery_timeout_ms: defaults::messenger::DELIVERY_TIMEOUT_MS,
        }
    }
}

impl Default for ObserverSettings {
    fn default() -> Self {
        Self {
            notice_timeout_ms: defaults::observer::NOTICE_TIMEOUT_MS,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: defaults::logging::LEVEL.to_string(),
            json: false,
        }
    }
}

impl LooperSettings {
    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }

    pub fn thread_name(&self, looper_name: &str) -> String {
        format!("{}:{}", self.thread_name_prefix, looper_name)
    }
}

impl MessengerSettings {
    pub fn reply_timeout(&self) -> Option<Duration> {
        self.reply_timeout_ms.map(Duration::from_millis)
    }

    pub fn delivery_timeout(&self) -> Option<Duration> {
        self.delivery_timeout_ms.map(Duration::from_millis)
    }
}

impl ObserverSettings {
    pub fn notice_timeout(&self) -> Duration {
        Duration::from_millis(self.notice_timeout_ms)
    }
}

impl RuntimeConfig {
    /// Load configuration from an optional file with environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading runtime config: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("LOOPER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: RuntimeConfig = builder
            .build()
            .context("Failed to build runtime configuration")?
            .try_deserialize()
            .context("Failed to deserialize runtime configuration")?;

        config.validate()?;
        debug!(?config, "Runtime configuration loaded");
        Ok(config)
    }

    /// Parse a TOML document directly (no environment overrides)
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: RuntimeConfig = toml::from_str(text).context("Failed to parse runtime configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.looper.queue_capacity == Some(0) {
            bail!("looper.queue_capacity must be greater than zero when set");
        }
        if self.looper.thread_name_prefix.is_empty() {
            bail!("looper.thread_name_prefix must not be empty");
        }
        Ok(())
    }

    /// Install the process-wide configuration; fails if one is already in place
    pub fn install(config: RuntimeConfig) -> std::result::Result<(), RuntimeConfig> {
        GLOBAL.set(config)
    }

    /// Process-wide configuration, defaulted on first use
    pub fn global() -> &'static RuntimeConfig {
        GLOBAL.get_or_init(RuntimeConfig::default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.looper.thread_name_prefix, "looper");
        assert_eq!(config.looper.queue_capacity, None);
        assert_eq!(config.messenger.reply_timeout(), None);
        assert_eq!(config.observer.notice_timeout(), Duration::from_millis(50));
        assert_eq!(config.looper.thread_name("app"), "looper:app");
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("looper.toml");

        let config_content = r#"
[looper]
queue_capacity = 64
idle_wait_ms = 10

[messenger]
reply_timeout_ms = 2000

[logging]
level = "debug"
json = true
"#;

        fs::write(&config_path, config_content).unwrap();

        let config = RuntimeConfig::load(Some(&config_path)).unwrap();
        assert_eq!(config.looper.queue_capacity, Some(64));
        assert_eq!(config.looper.idle_wait(), Duration::from_millis(10));
        assert_eq!(config.looper.thread_name_prefix, "looper");
        assert_eq!(config.messenger.reply_timeout(), Some(Duration::from_secs(2)));
        assert_eq!(config.observer, ObserverSettings::default());
        assert!(config.logging.json);
    }

    #[test]
    fn test_validation_rejects_zero_capacity() {
        let err = RuntimeConfig::from_toml("[looper]\nqueue_capacity = 0\n").unwrap_err();
        assert!(err.to_string().contains("queue_capacity"));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(RuntimeConfig::load(Some(&dir.path().join("absent.toml"))).is_err());
    }
}
