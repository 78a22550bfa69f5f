//! # Looper Runtime Configuration
//!
//! Centralized settings for the message-passing runtime, so that thread
//! naming, queue bounds and the various wait timeouts are tuned in one place
//! instead of being scattered as literals across the dispatch code.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use looper_config::{RuntimeConfig, logging};
//!
//! let config = RuntimeConfig::load(Some("config/looper.toml".as_ref())).unwrap();
//! logging::init(&config.logging).unwrap();
//! RuntimeConfig::install(config).ok();
//!
//! let idle = RuntimeConfig::global().looper.idle_wait();
//! ```

pub mod defaults;
pub mod logging;
pub mod runtime_config;

pub use runtime_config::{
    LoggingSettings, LooperSettings, MessengerSettings, ObserverSettings, RuntimeConfig,
};
