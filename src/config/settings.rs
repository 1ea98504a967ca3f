//! TOML-based configuration for shapesync.
//!
//! Supports a config file (shapesync.toml) with environment variable expansion.
//!
//! Example configuration:
//! ```toml
//! [remote]
//! url = "${SHAPE_SERVICE_URL}"
//! request_timeout_secs = 60
//!
//! [storage]
//! directory = "~/.local/share/shapesync"
//! prefix = "shapesync"
//! schema_version = 3
//!
//! [readiness]
//! timeout_ms = 5000
//! poll_interval_ms = 100
//!
//! [contention]
//! backoff_ms = 100
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::schema::SCHEMA_VERSION;

/// Environment variable holding the shape endpoint base URL.
pub const URL_ENV_VAR: &str = "SHAPESYNC_URL";

/// Environment variable pointing at an explicit config file.
pub const CONFIG_ENV_VAR: &str = "SHAPESYNC_CONFIG";

/// Base URL used when neither the environment nor the config file sets one.
pub const DEFAULT_URL: &str = "http://localhost:3000";

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid shape endpoint URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Failed to determine storage directory")]
    NoStorageDir,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Remote shape endpoint.
    pub remote: RemoteSettings,

    /// Local replica storage.
    pub storage: StorageSettings,

    /// Initial-sync readiness detection.
    pub readiness: ReadinessSettings,

    /// Handling of "already subscribing" contention from the transport.
    pub contention: ContentionSettings,
}

/// Remote shape endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteSettings {
    /// Base URL (supports ${ENV_VAR} expansion). `SHAPESYNC_URL` wins when set.
    pub url: Option<String>,

    /// Per-request timeout. Must exceed the server's long-poll window.
    pub request_timeout_secs: u64,

    /// First delay after a transient request failure.
    pub retry_initial_ms: u64,

    /// Upper bound for the exponential retry delay.
    pub retry_max_ms: u64,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            url: None,
            request_timeout_secs: 60,
            retry_initial_ms: 250,
            retry_max_ms: 10_000,
        }
    }
}

impl RemoteSettings {
    /// Resolve the base URL: environment, then config file, then localhost.
    pub fn base_url(&self) -> Result<url::Url, SettingsError> {
        let raw = match env::var(URL_ENV_VAR) {
            Ok(value) if !value.trim().is_empty() => value,
            _ => match &self.url {
                Some(url) => expand_env_vars(url)?,
                None => DEFAULT_URL.to_string(),
            },
        };

        url::Url::parse(raw.trim()).map_err(|e| SettingsError::InvalidUrl {
            url: raw.clone(),
            reason: e.to_string(),
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_initial(&self) -> Duration {
        Duration::from_millis(self.retry_initial_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }
}

/// Local storage configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Directory holding one SQLite file per identity.
    pub directory: Option<String>,

    /// Prefix of every database name owned by this crate.
    pub prefix: String,

    /// Bump to force every client to discard and re-snapshot.
    pub schema_version: u32,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            directory: None,
            prefix: "shapesync".to_string(),
            schema_version: SCHEMA_VERSION,
        }
    }
}

impl StorageSettings {
    /// Resolve the storage directory.
    ///
    /// Defaults to `<data_local_dir>/shapesync`.
    pub fn resolved_directory(&self) -> Result<PathBuf, SettingsError> {
        if let Some(dir) = &self.directory {
            return Ok(PathBuf::from(expand_env_vars(dir)?));
        }
        let base = dirs::data_local_dir().ok_or(SettingsError::NoStorageDir)?;
        Ok(base.join("shapesync"))
    }
}

/// Readiness detection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReadinessSettings {
    /// Backstop after which the initial sync resolves anyway.
    pub timeout_ms: u64,

    /// How often the stream's caught-up flag is polled.
    pub poll_interval_ms: u64,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            poll_interval_ms: 100,
        }
    }
}

impl ReadinessSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Contention handling configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ContentionSettings {
    /// Pause before re-checking the cache and retrying once.
    pub backoff_ms: u64,
}

impl Default for ContentionSettings {
    fn default() -> Self {
        Self { backoff_ms: 100 }
    }
}

impl ContentionSettings {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `SHAPESYNC_CONFIG`
    /// 2. `./shapesync.toml`
    /// 3. `~/.config/shapesync/config.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var(CONFIG_ENV_VAR) {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("shapesync.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("shapesync").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        Ok(Settings::default())
    }

    /// Reject values that would stall or break the sync layer.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.storage.prefix.trim().is_empty() {
            return Err(SettingsError::InvalidConfig(
                "storage.prefix must not be empty".to_string(),
            ));
        }
        if self.readiness.poll_interval_ms == 0 {
            return Err(SettingsError::InvalidConfig(
                "readiness.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.remote.retry_initial_ms == 0 || self.remote.retry_max_ms < self.remote.retry_initial_ms
        {
            return Err(SettingsError::InvalidConfig(
                "remote.retry_initial_ms must be non-zero and not exceed remote.retry_max_ms"
                    .to_string(),
            ));
        }
        if let Some(url) = &self.remote.url {
            // Only literal URLs can be checked up front.
            if !url.contains('$') {
                url::Url::parse(url).map_err(|e| SettingsError::InvalidUrl {
                    url: url.clone(),
                    reason: e.to_string(),
                })?;
            }
        }
        Ok(())
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }

        let mut var_name = String::new();
        if chars.peek() == Some(&'{') {
            chars.next();
            for ch in chars.by_ref() {
                if ch == '}' {
                    break;
                }
                var_name.push(ch);
            }
        } else {
            while let Some(&ch) = chars.peek() {
                if !(ch.is_alphanumeric() || ch == '_') {
                    break;
                }
                var_name.push(ch);
                chars.next();
            }
            if var_name.is_empty() {
                // Just a lone $, keep it
                result.push('$');
                continue;
            }
        }

        let value =
            env::var(&var_name).map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
        result.push_str(&value);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars_braces() {
        env::set_var("SHAPESYNC_TEST_VAR", "hello");
        assert_eq!(expand_env_vars("${SHAPESYNC_TEST_VAR}").unwrap(), "hello");
        assert_eq!(
            expand_env_vars("prefix_${SHAPESYNC_TEST_VAR}_suffix").unwrap(),
            "prefix_hello_suffix"
        );
        env::remove_var("SHAPESYNC_TEST_VAR");
    }

    #[test]
    fn test_expand_env_vars_no_braces() {
        env::set_var("SHAPESYNC_TEST_VAR2", "world");
        assert_eq!(expand_env_vars("$SHAPESYNC_TEST_VAR2").unwrap(), "world");
        assert_eq!(expand_env_vars("$SHAPESYNC_TEST_VAR2!").unwrap(), "world!");
        assert_eq!(expand_env_vars("cost: $").unwrap(), "cost: $");
        env::remove_var("SHAPESYNC_TEST_VAR2");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("${NONEXISTENT_SHAPESYNC_VAR_12345}");
        assert!(matches!(result, Err(SettingsError::MissingEnvVar(_))));
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[remote]
url = "https://shapes.example.com"
request_timeout_secs = 30

[storage]
directory = "/tmp/replicas"
prefix = "replica"
schema_version = 9

[readiness]
timeout_ms = 2500
poll_interval_ms = 50

[contention]
backoff_ms = 20
"#;

        let settings: Settings = toml::from_str(toml).unwrap();
        settings.validate().unwrap();

        assert_eq!(settings.remote.request_timeout(), Duration::from_secs(30));
        assert_eq!(settings.storage.prefix, "replica");
        assert_eq!(settings.storage.schema_version, 9);
        assert_eq!(
            settings.storage.resolved_directory().unwrap(),
            PathBuf::from("/tmp/replicas")
        );
        assert_eq!(settings.readiness.timeout(), Duration::from_millis(2500));
        assert_eq!(settings.readiness.poll_interval(), Duration::from_millis(50));
        assert_eq!(settings.contention.backoff(), Duration::from_millis(20));
    }

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();

        assert!(settings.validate().is_ok());
        assert_eq!(settings.storage.prefix, "shapesync");
        assert_eq!(settings.storage.schema_version, SCHEMA_VERSION);
        assert_eq!(settings.readiness.timeout_ms, 5_000);
        assert_eq!(settings.readiness.poll_interval_ms, 100);
        assert_eq!(settings.contention.backoff_ms, 100);
    }

    #[test]
    fn test_base_url_from_config_file_value() {
        // Only meaningful when the override variable is not set in the environment.
        if env::var(URL_ENV_VAR).is_ok() {
            return;
        }
        let remote = RemoteSettings {
            url: Some("https://shapes.example.com/base/".to_string()),
            ..Default::default()
        };
        assert_eq!(
            remote.base_url().unwrap().as_str(),
            "https://shapes.example.com/base/"
        );

        let fallback = RemoteSettings::default();
        assert_eq!(fallback.base_url().unwrap().as_str(), "http://localhost:3000/");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.readiness.poll_interval_ms = 0;
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::InvalidConfig(_))
        ));

        let mut settings = Settings::default();
        settings.storage.prefix = "  ".to_string();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.remote.url = Some("not a url".to_string());
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::InvalidUrl { .. })
        ));
    }
}
