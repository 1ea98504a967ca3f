//! Configuration module for shapesync.
//!
//! Handles the config file, environment variables, and per-concern settings.

mod settings;

pub use settings::{
    expand_env_vars, ContentionSettings, ReadinessSettings, RemoteSettings, Settings,
    SettingsError, StorageSettings, CONFIG_ENV_VAR, DEFAULT_URL, URL_ENV_VAR,
};
