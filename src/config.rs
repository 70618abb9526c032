//! Engine configuration
//!
//! Settings come from three layers, later ones winning:
//! - built-in defaults
//! - a JSON file (`config.json` in the platform config dir, or an explicit path)
//! - `PREFSYNC_*` environment variables (a `.env` file is honoured)

use crate::sync::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Constants
// ============================================================================

pub const ENV_PREFIX: &str = "PREFSYNC_";
const CONFIG_FILE_NAME: &str = "config.json";
const MAX_REFRESH_INTERVAL_MINUTES: u64 = 1440;

// ============================================================================
// Data Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Backend origin, e.g. `https://app.example.com`
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub debounce_ms: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub jitter_fraction: f64,
    pub max_delay_ms: u64,
    pub max_payload_bytes: usize,
    /// Background refresh period; 0 disables it
    pub refresh_interval_minutes: u64,
    pub history_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            request_timeout_secs: 30,
            debounce_ms: 350,
            max_attempts: 3,
            base_delay_ms: 500,
            backoff_factor: 2.0,
            jitter_fraction: 0.2,
            max_delay_ms: 10_000,
            max_payload_bytes: 1024 * 1024,
            refresh_interval_minutes: 0,
            history_capacity: 50,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON config file; missing fields take their defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// File (explicit path, else the default location if it exists), then env
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let file = match path {
            Some(path) => Some(path.to_path_buf()),
            None => default_path().filter(|p| p.exists()),
        };

        let mut config = match file {
            Some(path) => {
                log::info!("Loading configuration from {}", path.display());
                Self::from_file(&path)?
            }
            None => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `PREFSYNC_*` variables found through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(url) = var("BASE_URL") {
            self.base_url = url;
        }
        override_parsed(&mut self.request_timeout_secs, "REQUEST_TIMEOUT_SECS", &var)?;
        override_parsed(&mut self.debounce_ms, "DEBOUNCE_MS", &var)?;
        override_parsed(&mut self.max_attempts, "MAX_ATTEMPTS", &var)?;
        override_parsed(&mut self.base_delay_ms, "BASE_DELAY_MS", &var)?;
        override_parsed(&mut self.backoff_factor, "BACKOFF_FACTOR", &var)?;
        override_parsed(&mut self.jitter_fraction, "JITTER_FRACTION", &var)?;
        override_parsed(&mut self.max_delay_ms, "MAX_DELAY_MS", &var)?;
        override_parsed(&mut self.max_payload_bytes, "MAX_PAYLOAD_BYTES", &var)?;
        override_parsed(&mut self.refresh_interval_minutes, "REFRESH_INTERVAL_MINUTES", &var)?;
        override_parsed(&mut self.history_capacity, "HISTORY_CAPACITY", &var)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("base_url must not be empty".to_string()));
        }
        url::Url::parse(&self.base_url)
            .map_err(|e| ConfigError::Invalid(format!("base_url {:?}: {}", self.base_url, e)))?;

        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".to_string()));
        }
        if !(self.backoff_factor >= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "backoff_factor must be >= 1.0, got {}",
                self.backoff_factor
            )));
        }
        if !(0.0..1.0).contains(&self.jitter_fraction) {
            return Err(ConfigError::Invalid(format!(
                "jitter_fraction must be in [0, 1), got {}",
                self.jitter_fraction
            )));
        }
        if self.refresh_interval_minutes > MAX_REFRESH_INTERVAL_MINUTES {
            return Err(ConfigError::Invalid(format!(
                "refresh_interval_minutes must be 0-{}, got {}",
                MAX_REFRESH_INTERVAL_MINUTES, self.refresh_interval_minutes
            )));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.base_delay_ms))
            .with_backoff_factor(self.backoff_factor)
            .with_jitter(self.jitter_fraction)
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// `None` when background refresh is disabled
    pub fn refresh_interval(&self) -> Option<Duration> {
        match self.refresh_interval_minutes {
            0 => None,
            minutes => Some(Duration::from_secs(minutes * 60)),
        }
    }
}

fn override_parsed<T, F>(field: &mut T, name: &str, var: &F) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = var(name) {
        *field = raw.trim().parse().map_err(|e: T::Err| ConfigError::Env {
            var: format!("{}{}", ENV_PREFIX, name),
            message: e.to_string(),
        })?;
    }
    Ok(())
}

/// Platform config location, e.g. `~/.config/prefsync/config.json`
pub fn default_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("com", "prefsync", "prefsync").map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("Malformed config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid value for {var}: {message}")]
    Env { var: String, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.debounce(), Duration::from_millis(350));
        assert_eq!(config.refresh_interval(), None);

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay_for(0), Duration::from_millis(500));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = EngineConfig::default();
        config
            .apply_env(lookup(&[
                ("PREFSYNC_BASE_URL", "https://prefs.example.com"),
                ("PREFSYNC_MAX_ATTEMPTS", "5"),
                ("PREFSYNC_JITTER_FRACTION", " 0.1 "),
                ("PREFSYNC_REFRESH_INTERVAL_MINUTES", "15"),
            ]))
            .unwrap();

        assert_eq!(config.base_url, "https://prefs.example.com");
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.jitter_fraction, 0.1);
        assert_eq!(config.refresh_interval(), Some(Duration::from_secs(900)));
        assert_eq!(config.debounce_ms, 350);
    }

    #[test]
    fn test_env_parse_error_names_variable() {
        let mut config = EngineConfig::default();
        let err = config.apply_env(lookup(&[("PREFSYNC_DEBOUNCE_MS", "soon")])).unwrap_err();
        match err {
            ConfigError::Env { var, .. } => assert_eq!(var, "PREFSYNC_DEBOUNCE_MS"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let cases = vec![
            EngineConfig { max_attempts: 0, ..EngineConfig::default() },
            EngineConfig { backoff_factor: 0.5, ..EngineConfig::default() },
            EngineConfig { backoff_factor: f64::NAN, ..EngineConfig::default() },
            EngineConfig { jitter_fraction: 1.0, ..EngineConfig::default() },
            EngineConfig { base_url: "".to_string(), ..EngineConfig::default() },
            EngineConfig { base_url: "::not a url".to_string(), ..EngineConfig::default() },
            EngineConfig { refresh_interval_minutes: 1441, ..EngineConfig::default() },
        ];
        for config in cases {
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))), "{:?}", config);
        }
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{ "base_url": "https://example.org", "debounce_ms": 100 }}"#).unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.base_url, "https://example.org");
        assert_eq!(config.debounce_ms, 100);
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn test_from_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.json");
        assert!(matches!(EngineConfig::from_file(&missing), Err(ConfigError::Io { .. })));

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{ not json").unwrap();
        assert!(matches!(EngineConfig::from_file(&broken), Err(ConfigError::Parse { .. })));
    }
}
