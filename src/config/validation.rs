//! Configuration errors and value parsing helpers.

use std::sync::OnceLock;
use std::time::Duration;

use regex::{Captures, Regex};
use thiserror::Error;

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse YAML configuration.
    #[error("failed to parse YAML config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Configuration validation failed.
    #[error("config validation error: {0}")]
    ValidationError(String),
}

/// Parse a human-readable duration: `30s`, `5m`, `1h30m`, `7d`, `100ms`.
///
/// # Examples
///
/// ```
/// use spanvault::config::parse_duration;
///
/// assert_eq!(parse_duration("90s").unwrap().as_secs(), 90);
/// assert_eq!(parse_duration("7d").unwrap().as_secs(), 7 * 86_400);
/// ```
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ConfigError::ValidationError(
            "duration string is empty".to_string(),
        ));
    }
    humantime::parse_duration(s)
        .map_err(|e| ConfigError::ValidationError(format!("invalid duration '{s}': {e}")))
}

/// Expand `${VAR}` and `${VAR:-default}` references.
///
/// Unset variables without a default expand to the empty string.
pub fn expand_env_vars(input: &str) -> String {
    static ENV_VAR_REGEX: OnceLock<Regex> = OnceLock::new();

    let regex = ENV_VAR_REGEX.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("failed to compile env var regex")
    });

    regex
        .replace_all(input, |caps: &Captures| match std::env::var(&caps[1]) {
            Ok(value) if !value.is_empty() => value,
            _ => caps.get(2).map_or_else(String::new, |m| m.as_str().to_string()),
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_valid() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration(" 5m ").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(604_800));
    }

    #[test]
    fn test_parse_duration_invalid() {
        for bad in ["", "abc", "30x", "30"] {
            assert!(
                matches!(parse_duration(bad), Err(ConfigError::ValidationError(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn test_expand_env_vars_passthrough() {
        assert_eq!(expand_env_vars("path: data/db.duckdb"), "path: data/db.duckdb");
        assert_eq!(expand_env_vars("cost: $5"), "cost: $5");
    }

    #[test]
    fn test_expand_env_vars_defaults() {
        assert_eq!(
            expand_env_vars("${SPANVAULT_NONEXISTENT_12345:-fallback}/x"),
            "fallback/x"
        );
        assert_eq!(expand_env_vars("[${SPANVAULT_NONEXISTENT_12345}]"), "[]");
    }

    #[test]
    fn test_expand_env_vars_from_env() {
        // SAFETY: the variable name is unique to this test.
        unsafe {
            std::env::set_var("SPANVAULT_TEST_EXPAND", "/var/tmp/vault");
        }
        assert_eq!(
            expand_env_vars("${SPANVAULT_TEST_EXPAND:-unused}/spans.duckdb"),
            "/var/tmp/vault/spans.duckdb"
        );
        // SAFETY: cleanup of the same test-only variable.
        unsafe {
            std::env::remove_var("SPANVAULT_TEST_EXPAND");
        }
    }
}
