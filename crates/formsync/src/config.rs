//! Runtime configuration.
//!
//! Settings come from an optional TOML file; every field has a default so an
//! empty or missing file yields a working configuration. The binary layers
//! command-line flags and environment variables on top.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database connection settings.
    pub database: DatabaseConfig,
    /// Migration queue settings.
    pub queue: QueueConfig,
    /// Identifier naming settings.
    pub naming: NamingConfig,
    /// Backup retention settings.
    pub retention: RetentionConfig,
}

impl Config {
    /// Loads configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
            .map_err(|e| MigrateError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Loads configuration from a file if given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Parses configuration from TOML text.
    pub fn from_toml(contents: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }
}

/// Database connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite URL.
    pub url: String,
    /// Pool size.
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:formsync.sqlite3".to_string(),
            max_connections: 5,
        }
    }
}

/// Migration queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Jobs processed in parallel (on distinct tables).
    pub worker_concurrency: usize,
    /// Attempts before a transient failure becomes terminal.
    pub max_attempts: u32,
    /// First retry delay.
    pub backoff_base_ms: u64,
    /// Retry delay ceiling.
    pub backoff_max_ms: u64,
    /// Idle poll interval when no wake-up arrives.
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 4,
            max_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            poll_interval_ms: 500,
        }
    }
}

impl QueueConfig {
    /// Delay before the retry that follows `attempt` failed attempts.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self.backoff_base_ms.saturating_mul(1_u64 << exponent);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }

    /// Idle poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Identifier naming settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    /// Base URL of the translation service; `None` disables tier 2.
    pub translator_url: Option<String>,
    /// Upper bound on one translation call.
    pub timeout_ms: u64,
    /// Minimum accepted translation quality, 0.0 to 1.0.
    pub min_quality: f64,
    /// Source language code.
    pub source_lang: String,
    /// Target language code.
    pub target_lang: String,
    /// Extra dictionary entries, phrase to identifier.
    pub dictionary: BTreeMap<String, String>,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            translator_url: None,
            timeout_ms: 5_000,
            min_quality: 0.8,
            source_lang: "th".to_string(),
            target_lang: "en".to_string(),
            dictionary: BTreeMap::new(),
        }
    }
}

impl NamingConfig {
    /// Translation timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Backup retention settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Days a backup is kept before the sweep may delete it.
    pub backup_days: i64,
    /// Interval between sweeps when running workers.
    pub sweep_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            backup_days: 90,
            sweep_interval_secs: 3_600,
        }
    }
}

impl RetentionConfig {
    /// Retention period.
    #[must_use]
    pub fn period(&self) -> chrono::Duration {
        chrono::Duration::days(self.backup_days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.retention.backup_days, 90);
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::from_toml(
            r#"
[queue]
worker_concurrency = 2

[naming]
translator_url = "http://localhost:8765"

[naming.dictionary]
"แผนก" = "department"
"#,
        )
        .unwrap();
        assert_eq!(config.queue.worker_concurrency, 2);
        assert_eq!(config.queue.max_attempts, 5);
        assert_eq!(
            config.naming.translator_url.as_deref(),
            Some("http://localhost:8765")
        );
        assert_eq!(config.naming.dictionary["แผนก"], "department");
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let queue = QueueConfig {
            backoff_base_ms: 100,
            backoff_max_ms: 350,
            ..QueueConfig::default()
        };
        assert_eq!(queue.backoff(1), Duration::from_millis(100));
        assert_eq!(queue.backoff(2), Duration::from_millis(200));
        assert_eq!(queue.backoff(3), Duration::from_millis(350));
        assert_eq!(queue.backoff(30), Duration::from_millis(350));
    }

    #[test]
    fn test_load_reports_path_on_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("formsync.toml");
        fs::write(&path, "queue = 3").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("formsync.toml"));
    }
}
