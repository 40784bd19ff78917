// src/core/config.rs

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::core::common::DbError;

/// Represents the configuration for doclite.
///
/// This struct encapsulates the tunables of the engine. It supports
/// loading from a TOML file (e.g. `doclite.toml`) and provides sensible
/// default values matching the engine's hard limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Number of pages kept in the pager cache.
    /// Default: 1024 (16 MiB of 16 KiB pages)
    #[serde(default = "default_page_cache_pages")]
    pub page_cache_pages: usize,

    /// Budget in milliseconds for each blocking lock acquisition, and
    /// the default transaction timeout.
    /// Default: 30 000
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Seconds a session may stay idle before the sweep removes it.
    /// Default: 1800 (30 minutes)
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,

    /// Interval of the session TTL sweep in seconds.
    /// Default: 300 (5 minutes)
    #[serde(default = "default_session_sweep_interval_secs")]
    pub session_sweep_interval_secs: u64,

    /// Seconds a cursor may stay idle before the sweep kills it.
    /// Default: 600 (10 minutes)
    #[serde(default = "default_cursor_ttl_secs")]
    pub cursor_ttl_secs: u64,

    /// Interval of the cursor TTL sweep in seconds.
    /// Default: 60
    #[serde(default = "default_cursor_sweep_interval_secs")]
    pub cursor_sweep_interval_secs: u64,

    /// Documents returned per cursor batch when the client does not ask
    /// for a specific size.
    /// Default: 101
    #[serde(default = "default_batch_size")]
    pub default_batch_size: usize,
}

// Default value functions for serde
fn default_page_cache_pages() -> usize {
    1024
}
fn default_lock_timeout_ms() -> u64 {
    30_000
}
fn default_session_ttl_secs() -> u64 {
    30 * 60
}
fn default_session_sweep_interval_secs() -> u64 {
    5 * 60
}
fn default_cursor_ttl_secs() -> u64 {
    10 * 60
}
fn default_cursor_sweep_interval_secs() -> u64 {
    60
}
fn default_batch_size() -> usize {
    101
}

impl Default for Config {
    fn default() -> Self {
        Config {
            page_cache_pages: default_page_cache_pages(),
            lock_timeout_ms: default_lock_timeout_ms(),
            session_ttl_secs: default_session_ttl_secs(),
            session_sweep_interval_secs: default_session_sweep_interval_secs(),
            cursor_ttl_secs: default_cursor_ttl_secs(),
            cursor_sweep_interval_secs: default_cursor_sweep_interval_secs(),
            default_batch_size: default_batch_size(),
        }
    }
}

impl Config {
    /// Loads configuration from a TOML file.
    ///
    /// If the specified file does not exist, default configuration
    /// values are returned.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Configuration` if the file cannot be read or if
    /// parsing fails.
    pub fn load_from_file(path: &Path) -> Result<Self, DbError> {
        match fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).map_err(|e| {
                DbError::Configuration(format!(
                    "failed to parse config file '{}': {e}",
                    path.display()
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(e) => Err(DbError::Io(e)),
        }
    }

    /// Loads configuration from an optional TOML file path, falling back
    /// to defaults when `None` or when the file is absent.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Configuration` if a provided file cannot be
    /// read or parsed.
    pub fn load_or_default(optional_path: Option<&Path>) -> Result<Self, DbError> {
        match optional_path {
            Some(path) => Self::load_from_file(path),
            None => Ok(Config::default()),
        }
    }

    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    #[must_use]
    pub const fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    #[must_use]
    pub const fn session_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session_sweep_interval_secs)
    }

    #[must_use]
    pub const fn cursor_ttl(&self) -> Duration {
        Duration::from_secs(self.cursor_ttl_secs)
    }

    #[must_use]
    pub const fn cursor_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cursor_sweep_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.page_cache_pages, 1024);
        assert_eq!(config.lock_timeout_ms, 30_000);
        assert_eq!(config.session_ttl_secs, 1800);
        assert_eq!(config.session_sweep_interval_secs, 300);
        assert_eq!(config.cursor_ttl_secs, 600);
        assert_eq!(config.cursor_sweep_interval_secs, 60);
        assert_eq!(config.default_batch_size, 101);
    }

    #[test]
    fn test_load_from_existing_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        let config_content = r#"
            page_cache_pages = 64
            lock_timeout_ms = 1000
            session_ttl_secs = 60
            cursor_ttl_secs = 30
        "#;
        writeln!(temp_file, "{}", config_content).unwrap();

        let config = Config::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.page_cache_pages, 64);
        assert_eq!(config.lock_timeout(), Duration::from_secs(1));
        assert_eq!(config.session_ttl(), Duration::from_secs(60));
        assert_eq!(config.cursor_ttl(), Duration::from_secs(30));
        // Missing fields fall back to defaults.
        assert_eq!(config.default_batch_size, 101);
        assert_eq!(config.session_sweep_interval_secs, 300);
    }

    #[test]
    fn test_load_from_non_existent_file_returns_default() {
        let config = Config::load_from_file(Path::new("does_not_exist.toml")).unwrap();
        assert_eq!(config.page_cache_pages, Config::default().page_cache_pages);
    }

    #[test]
    fn test_load_from_malformed_file_returns_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "this is not valid toml content").unwrap();
        let result = Config::load_from_file(temp_file.path());
        assert!(matches!(result, Err(DbError::Configuration(_))));
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "mystery_knob = 7").unwrap();
        let result = Config::load_from_file(temp_file.path());
        assert!(matches!(result, Err(DbError::Configuration(_))));
    }

    #[test]
    fn test_load_or_default_with_none() {
        let config = Config::load_or_default(None).unwrap();
        assert_eq!(config.lock_timeout_ms, Config::default().lock_timeout_ms);
    }
}
