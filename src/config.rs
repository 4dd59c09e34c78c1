//! Leasehold Configuration
//!
//! This module provides configuration structures for the coordinator,
//! the participating processes and their embedded store.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main Leasehold configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeaseholdConfig {
    /// Coordinator configuration
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Embedded store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Liveness signal configuration
    #[serde(default)]
    pub liveness: LivenessConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Coordinator timing and routing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Address the coordinator listens on for processes
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Heartbeat probe interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Silence from the active process longer than this marks it failed
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Delay between choosing a candidate and promoting it
    #[serde(default = "default_promotion_grace_ms")]
    pub promotion_grace_ms: u64,

    /// First retry delay for a pending query; doubles per attempt
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Attempts allowed before a query fails with retries exhausted
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Connect timeout used by processes, in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Embedded store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file (":memory:" for an in-memory store)
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Attempts to open the store before reporting an initialization error
    #[serde(default = "default_open_attempts")]
    pub open_attempts: u32,

    /// Backoff before the second open attempt; doubles afterwards
    #[serde(default = "default_open_backoff_ms")]
    pub open_backoff_ms: u64,

    /// Busy timeout handed to SQLite
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Hold the database file exclusively while owning it
    #[serde(default = "default_true")]
    pub exclusive_locking: bool,
}

/// Liveness lease backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LivenessBackend {
    /// No liveness signal; failover relies on heartbeats only
    None,
    /// In-process named leases
    Local,
    /// Advisory file locks shared by all processes on the host
    File,
}

/// Liveness signal configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    #[serde(default = "default_liveness_backend")]
    pub backend: LivenessBackend,

    /// Directory holding lock files for the file backend
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1:7700".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_heartbeat_timeout_ms() -> u64 {
    5000
}

fn default_promotion_grace_ms() -> u64 {
    250
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

fn default_max_retries() -> u32 {
    8
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_store_path() -> PathBuf {
    PathBuf::from("leasehold.db")
}

fn default_open_attempts() -> u32 {
    5
}

fn default_open_backoff_ms() -> u64 {
    100
}

fn default_busy_timeout_ms() -> u64 {
    2000
}

fn default_liveness_backend() -> LivenessBackend {
    LivenessBackend::File
}

fn default_lock_dir() -> PathBuf {
    std::env::temp_dir().join("leasehold-locks")
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "127.0.0.1:7780".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            promotion_grace_ms: default_promotion_grace_ms(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            max_retries: default_max_retries(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            open_attempts: default_open_attempts(),
            open_backoff_ms: default_open_backoff_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
            exclusive_locking: true,
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            backend: default_liveness_backend(),
            lock_dir: default_lock_dir(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl CoordinatorConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn promotion_grace(&self) -> Duration {
        Duration::from_millis(self.promotion_grace_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl StoreConfig {
    pub fn open_backoff(&self) -> Duration {
        Duration::from_millis(self.open_backoff_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// In-memory store configuration (tests, demos)
    pub fn in_memory() -> Self {
        Self {
            path: PathBuf::from(":memory:"),
            open_backoff_ms: 10,
            ..Self::default()
        }
    }
}

impl LeaseholdConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: LeaseholdConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("cannot render configuration: {}", e)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        let c = &self.coordinator;

        if c.bind_address.is_empty() {
            return Err(crate::Error::Config("coordinator.bind_address cannot be empty".into()));
        }

        if c.heartbeat_interval_ms == 0 {
            return Err(crate::Error::Config("coordinator.heartbeat_interval_ms must be positive".into()));
        }

        if c.heartbeat_timeout_ms <= c.heartbeat_interval_ms {
            return Err(crate::Error::Config(
                "coordinator.heartbeat_timeout_ms must exceed heartbeat_interval_ms".into(),
            ));
        }

        if c.retry_base_delay_ms == 0 {
            return Err(crate::Error::Config("coordinator.retry_base_delay_ms must be positive".into()));
        }

        if c.max_retries == 0 || c.max_retries > 30 {
            return Err(crate::Error::Config("coordinator.max_retries must be between 1 and 30".into()));
        }

        if self.store.open_attempts == 0 {
            return Err(crate::Error::Config("store.open_attempts must be positive".into()));
        }

        if self.store.path.as_os_str().is_empty() {
            return Err(crate::Error::Config("store.path cannot be empty".into()));
        }

        Ok(())
    }
}
