//! Application configuration structures.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::live::{DEFAULT_SUBSCRIBER_CAPACITY, LiveBroadcaster};
use crate::retention::{
    DEFAULT_MAX_LOG_COUNT, DEFAULT_MAX_SPAN_COUNT, DEFAULT_RETENTION_INTERVAL,
    DEFAULT_TARGET_RATIO, RetentionPolicy,
};
use crate::storage::{
    DEFAULT_CHECKPOINT_INTERVAL, DEFAULT_MAX_CONCURRENT_READS, DEFAULT_QUEUE_CAPACITY,
    DEFAULT_READ_IDLE_TIMEOUT, DEFAULT_SHUTDOWN_GRACE, MEMORY_PATH, StoreBuilder,
    validate_archive_dir,
};

use super::validation::{ConfigError, expand_env_vars};

// =============================================================================
// Constants
// =============================================================================

/// Default database file.
pub const DEFAULT_DB_PATH: &str = "data/spanvault.duckdb";

/// Default age limit in days.
pub const DEFAULT_MAX_AGE_DAYS: u32 = 30;

fn default_db_path() -> String {
    DEFAULT_DB_PATH.to_string()
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_max_concurrent_reads() -> usize {
    DEFAULT_MAX_CONCURRENT_READS
}

fn default_checkpoint_interval() -> Duration {
    DEFAULT_CHECKPOINT_INTERVAL
}

fn default_shutdown_grace() -> Duration {
    DEFAULT_SHUTDOWN_GRACE
}

fn default_read_idle_timeout() -> Duration {
    DEFAULT_READ_IDLE_TIMEOUT
}

fn default_retention_interval() -> Duration {
    DEFAULT_RETENTION_INTERVAL
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Database Configuration
// =============================================================================

/// Database configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database file path; `:memory:` keeps everything in memory.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Pending write jobs before drop-oldest kicks in (default: 1000).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Concurrent read leases (default: 8).
    #[serde(default = "default_max_concurrent_reads")]
    pub max_concurrent_reads: usize,

    /// Idle checkpoint interval (default: 5s).
    #[serde(default = "default_checkpoint_interval", with = "humantime_serde")]
    pub checkpoint_interval: Duration,

    /// Time queued writes get to drain on shutdown (default: 3s).
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,

    /// Idle read connections are closed after this long (default: 10m).
    #[serde(default = "default_read_idle_timeout", with = "humantime_serde")]
    pub read_idle_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_concurrent_reads: DEFAULT_MAX_CONCURRENT_READS,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            read_idle_timeout: DEFAULT_READ_IDLE_TIMEOUT,
        }
    }
}

impl DatabaseConfig {
    pub fn is_memory(&self) -> bool {
        self.path.is_empty() || self.path == MEMORY_PATH
    }
}

// =============================================================================
// Retention Configuration
// =============================================================================

/// Retention configuration. A zero limit disables that limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_retention_interval", with = "humantime_serde")]
    pub interval: Duration,

    pub max_age_days: u32,
    pub max_span_count: u64,
    pub max_log_count: u64,

    /// Fraction of a ceiling kept after trimming (default: 0.9).
    pub target_ratio: f64,

    /// Export aged-out spans to Parquet here before deleting them.
    pub archive_dir: Option<PathBuf>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: DEFAULT_RETENTION_INTERVAL,
            max_age_days: DEFAULT_MAX_AGE_DAYS,
            max_span_count: DEFAULT_MAX_SPAN_COUNT,
            max_log_count: DEFAULT_MAX_LOG_COUNT,
            target_ratio: DEFAULT_TARGET_RATIO,
            archive_dir: None,
        }
    }
}

impl RetentionConfig {
    pub fn to_policy(&self) -> RetentionPolicy {
        let non_zero = |n: u64| (n > 0).then_some(n);
        RetentionPolicy {
            interval: self.interval,
            max_age: (self.max_age_days > 0)
                .then(|| Duration::from_secs(u64::from(self.max_age_days) * 24 * 60 * 60)),
            max_span_count: non_zero(self.max_span_count),
            max_log_count: non_zero(self.max_log_count),
            target_ratio: self.target_ratio,
            archive_dir: self.archive_dir.clone(),
        }
    }
}

// =============================================================================
// Live Configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Buffered messages per subscriber (default: 1000).
    pub subscriber_capacity: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub live: LiveConfig,
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// `${VAR}` and `${VAR:-default}` references are expanded before parsing.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(&expand_env_vars(content))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let db = &self.database;
        if db.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "database queue_capacity must be positive".to_string(),
            ));
        }
        if db.max_concurrent_reads == 0 {
            return Err(ConfigError::ValidationError(
                "database max_concurrent_reads must be positive".to_string(),
            ));
        }
        if db.checkpoint_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "database checkpoint_interval must be non-zero".to_string(),
            ));
        }

        let retention = &self.retention;
        if retention.enabled && retention.interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "retention interval must be non-zero".to_string(),
            ));
        }
        if !(retention.target_ratio > 0.0 && retention.target_ratio <= 1.0) {
            return Err(ConfigError::ValidationError(format!(
                "retention target_ratio must be in (0, 1], got {}",
                retention.target_ratio
            )));
        }
        if let Some(dir) = &retention.archive_dir {
            validate_archive_dir(dir).map_err(|e| {
                ConfigError::ValidationError(format!("retention archive_dir: {e}"))
            })?;
        }

        if self.live.subscriber_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "live subscriber_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Store builder carrying the database and live settings.
    pub fn store_builder(&self) -> StoreBuilder {
        let db = &self.database;
        StoreBuilder::new(&db.path)
            .queue_capacity(db.queue_capacity)
            .max_concurrent_reads(db.max_concurrent_reads)
            .checkpoint_interval(db.checkpoint_interval)
            .shutdown_grace(db.shutdown_grace)
            .read_idle_timeout(db.read_idle_timeout)
            .broadcaster(LiveBroadcaster::new(self.live.subscriber_capacity))
    }
}
