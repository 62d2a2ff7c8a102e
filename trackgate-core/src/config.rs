//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/trackgate/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/trackgate/` (~/.config/trackgate/)
//! - Data: `$XDG_DATA_HOME/trackgate/` (~/.local/share/trackgate/)
//! - State/Logs: `$XDG_STATE_HOME/trackgate/` (~/.local/state/trackgate/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Collector identity and loading
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Consent-mode protocol settings
    #[serde(default)]
    pub consent: ConsentConfig,

    /// Sliding-window rate limit over all events
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Duplicate suppression window
    #[serde(default)]
    pub dedup: DedupConfig,

    /// Per-event sampling rates
    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Optional batching of accepted events
    #[serde(default)]
    pub batching: BatchingConfig,

    /// Dispatch retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Offline queue bounds and persistence
    #[serde(default)]
    pub queue: QueueConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Collector identity and loader settings
#[derive(Debug, Deserialize, Clone)]
pub struct CollectorConfig {
    /// Public measurement identifier (`G-XXXX` or `UA-1234-1`)
    pub measurement_id: Option<String>,

    /// Loader script base URL; the measurement id is appended as `?id=`
    #[serde(default = "default_loader_url")]
    pub loader_url: String,

    /// How long to wait for the loader script before warning
    #[serde(default = "default_load_timeout_ms")]
    pub load_timeout_ms: u64,

    /// Only production hosts ever load the collector
    #[serde(default)]
    pub production: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            measurement_id: None,
            loader_url: default_loader_url(),
            load_timeout_ms: default_load_timeout_ms(),
            production: false,
        }
    }
}

impl CollectorConfig {
    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }
}

fn default_loader_url() -> String {
    "https://www.googletagmanager.com/gtag/js".to_string()
}

fn default_load_timeout_ms() -> u64 {
    10_000
}

/// Consent-mode protocol settings
#[derive(Debug, Deserialize, Clone)]
pub struct ConsentConfig {
    /// Delay the collector waits for an `update` after the `default` command
    #[serde(default = "default_wait_for_update_ms")]
    pub wait_for_update_ms: u64,
}

impl Default for ConsentConfig {
    fn default() -> Self {
        Self {
            wait_for_update_ms: default_wait_for_update_ms(),
        }
    }
}

fn default_wait_for_update_ms() -> u64 {
    500
}

/// Sliding-window rate limit
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_max")]
    pub max_events: usize,

    #[serde(default = "default_rate_limit_window_ms")]
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_events: default_rate_limit_max(),
            window_ms: default_rate_limit_window_ms(),
        }
    }
}

fn default_rate_limit_max() -> usize {
    100
}

fn default_rate_limit_window_ms() -> u64 {
    10_000
}

/// Duplicate suppression window
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct DedupConfig {
    #[serde(default = "default_dedup_window_ms")]
    pub window_ms: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_ms: default_dedup_window_ms(),
        }
    }
}

fn default_dedup_window_ms() -> u64 {
    1_000
}

/// Per-event sampling rates in (0, 1]
///
/// Names without an entry are always kept. Out-of-range entries are
/// ignored with a warning when the sampler is built.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SamplingConfig {
    #[serde(default)]
    pub rates: HashMap<String, f64>,
}

/// Batching of accepted events
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct BatchingConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Flush once this many events are buffered
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Flush this long after the first buffered event
    #[serde(default = "default_batch_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            batch_size: default_batch_size(),
            timeout_ms: default_batch_timeout_ms(),
        }
    }
}

fn default_batch_size() -> usize {
    10
}

fn default_batch_timeout_ms() -> u64 {
    2_000
}

/// Dispatch retry policy
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    1_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

/// Offline queue bounds and persistence
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct QueueConfig {
    #[serde(default = "default_queue_max_size")]
    pub max_size: usize,

    /// Failed resend attempts before an entry is dropped
    #[serde(default = "default_queue_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_queue_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Mirror the queue into durable storage
    #[serde(default = "default_queue_persist")]
    pub persist: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: default_queue_max_size(),
            max_retries: default_queue_max_retries(),
            flush_interval_ms: default_queue_flush_interval_ms(),
            persist: default_queue_persist(),
        }
    }
}

fn default_queue_max_size() -> usize {
    100
}

fn default_queue_max_retries() -> u32 {
    3
}

fn default_queue_flush_interval_ms() -> u64 {
    5_000
}

fn default_queue_persist() -> bool {
    true
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.rate_limit.max_events == 0 {
            return Err(Error::Config(
                "rate_limit.max_events must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.window_ms == 0 {
            return Err(Error::Config(
                "rate_limit.window_ms must be positive".to_string(),
            ));
        }
        if self.dedup.window_ms == 0 {
            return Err(Error::Config("dedup.window_ms must be positive".to_string()));
        }
        if self.batching.batch_size == 0 {
            return Err(Error::Config(
                "batching.batch_size must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if !self.retry.backoff_multiplier.is_finite() || self.retry.backoff_multiplier < 1.0 {
            return Err(Error::Config(
                "retry.backoff_multiplier must be a finite number >= 1".to_string(),
            ));
        }
        if self.queue.max_size == 0 {
            return Err(Error::Config("queue.max_size must be at least 1".to_string()));
        }
        if self.queue.flush_interval_ms == 0 {
            return Err(Error::Config(
                "queue.flush_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/trackgate/config.toml` (~/.config/trackgate/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("trackgate").join("config.toml")
    }

    /// Returns the data directory path (for durable storage)
    ///
    /// `$XDG_DATA_HOME/trackgate/` (~/.local/share/trackgate/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("trackgate")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/trackgate/` (~/.local/state/trackgate/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("trackgate")
    }

    /// Returns the durable key-value store path
    ///
    /// `$XDG_DATA_HOME/trackgate/storage.db`
    pub fn storage_path() -> PathBuf {
        Self::data_dir().join("storage.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/trackgate/trackgate.log` (~/.local/state/trackgate/trackgate.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("trackgate.log")
    }
}
