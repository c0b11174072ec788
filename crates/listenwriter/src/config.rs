//! Writer configuration and JSON loading.
//!
//! Keys missing from a config file keep their default values.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::ConfigError;

/// Tunables for a [`ListenWriter`](crate::ListenWriter).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListenWriterConfig {
    /// Per-connection write deadline in milliseconds.
    pub write_timeout_ms: u64,
    /// First delay after a failed accept, in milliseconds.
    pub accept_backoff_initial_ms: u64,
    /// Upper bound for the accept backoff, in milliseconds.
    pub accept_backoff_max_ms: u64,
    /// Evict a connection after this many consecutive non-timeout write
    /// failures. `None` keeps failing connections indefinitely.
    pub max_consecutive_write_errors: Option<u32>,
    /// Buffer size used when relaying a reader with `copy_from`.
    pub copy_chunk_size: usize,
}

impl Default for ListenWriterConfig {
    fn default() -> Self {
        Self {
            write_timeout_ms: 5_000,
            accept_backoff_initial_ms: 5,
            accept_backoff_max_ms: 1_000,
            max_consecutive_write_errors: None,
            copy_chunk_size: 8 * 1024,
        }
    }
}

impl ListenWriterConfig {
    /// Per-connection write deadline.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Set the write deadline.
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the consecutive-error eviction limit.
    #[must_use]
    pub fn with_max_consecutive_write_errors(mut self, limit: Option<u32>) -> Self {
        self.max_consecutive_write_errors = limit;
        self
    }

    pub(crate) fn accept_backoff(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.accept_backoff_initial_ms),
            Duration::from_millis(self.accept_backoff_max_ms),
        )
    }

    /// Reject values the writer cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "writeTimeoutMs must be greater than zero".into(),
            ));
        }
        if self.copy_chunk_size == 0 {
            return Err(ConfigError::InvalidValue(
                "copyChunkSize must be greater than zero".into(),
            ));
        }
        if self.accept_backoff_initial_ms > self.accept_backoff_max_ms {
            return Err(ConfigError::InvalidValue(format!(
                "acceptBackoffInitialMs ({}) exceeds acceptBackoffMaxMs ({})",
                self.accept_backoff_initial_ms, self.accept_backoff_max_ms
            )));
        }
        if self.max_consecutive_write_errors == Some(0) {
            return Err(ConfigError::InvalidValue(
                "maxConsecutiveWriteErrors must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Load a config file, falling back to defaults when it does not exist.
pub fn load_config_from_path(path: &Path) -> Result<ListenWriterConfig, ConfigError> {
    if !path.exists() {
        debug!(?path, "config file not found, using defaults");
        return Ok(ListenWriterConfig::default());
    }

    debug!(?path, "loading listen writer config");
    let content = std::fs::read_to_string(path)?;
    let config: ListenWriterConfig = serde_json::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_write_timeout_is_five_seconds() {
        let cfg = ListenWriterConfig::default();
        assert_eq!(cfg.write_timeout(), Duration::from_secs(5));
        assert!(cfg.max_consecutive_write_errors.is_none());
        cfg.validate().unwrap();
    }

    #[test]
    fn builder_helpers() {
        let cfg = ListenWriterConfig::default()
            .with_write_timeout(Duration::from_millis(250))
            .with_max_consecutive_write_errors(Some(3));
        assert_eq!(cfg.write_timeout_ms, 250);
        assert_eq!(cfg.max_consecutive_write_errors, Some(3));
    }

    #[test]
    fn validate_rejects_zero_timeout() {
        let cfg = ListenWriterConfig {
            write_timeout_ms: 0,
            ..ListenWriterConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn validate_rejects_inverted_backoff() {
        let cfg = ListenWriterConfig {
            accept_backoff_initial_ms: 2_000,
            accept_backoff_max_ms: 1_000,
            ..ListenWriterConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("acceptBackoffInitialMs"));
    }

    #[test]
    fn validate_rejects_zero_error_limit() {
        let cfg = ListenWriterConfig::default().with_max_consecutive_write_errors(Some(0));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_chunk_size() {
        let cfg = ListenWriterConfig {
            copy_chunk_size: 0,
            ..ListenWriterConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn serializes_camel_case() {
        let value = serde_json::to_value(ListenWriterConfig::default()).unwrap();
        assert_eq!(value["writeTimeoutMs"], 5_000);
        assert_eq!(value["copyChunkSize"], 8_192);
        assert!(value["maxConsecutiveWriteErrors"].is_null());
    }

    #[test]
    fn null_error_limit_means_unbounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lw.json");
        std::fs::write(&path, r#"{"maxConsecutiveWriteErrors": null}"#).unwrap();
        let cfg = load_config_from_path(&path).unwrap();
        assert_eq!(cfg, ListenWriterConfig::default());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config_from_path(&dir.path().join("absent.json")).unwrap();
        assert_eq!(cfg, ListenWriterConfig::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lw.json");
        std::fs::write(&path, r#"{"writeTimeoutMs": 250, "maxConsecutiveWriteErrors": 3}"#).unwrap();

        let cfg = load_config_from_path(&path).unwrap();
        assert_eq!(cfg.write_timeout(), Duration::from_millis(250));
        assert_eq!(cfg.max_consecutive_write_errors, Some(3));
        assert_eq!(cfg.copy_chunk_size, 8 * 1024);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lw.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            load_config_from_path(&path),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn invalid_value_in_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lw.json");
        std::fs::write(&path, r#"{"writeTimeoutMs": 0}"#).unwrap();
        assert!(matches!(
            load_config_from_path(&path),
            Err(ConfigError::InvalidValue(_))
        ));
    }
}
