//! Configuration for the spanvault binary.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Database settings (path, queue capacity, read concurrency, checkpoints)
//! - Retention settings (interval, age and count limits, archive directory)
//! - Live fan-out settings (per-subscriber buffer)

mod app;
mod validation;

pub use app::{
    AppConfig, DEFAULT_DB_PATH, DEFAULT_MAX_AGE_DAYS, DatabaseConfig, LiveConfig, RetentionConfig,
};
pub use validation::{ConfigError, expand_env_vars, parse_duration};
