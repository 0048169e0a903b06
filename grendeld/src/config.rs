//! Configuration file handling for grendeld.

use std::path::Path;

use serde::Deserialize;

use grendel_broker::BrokerConfig;

/// Main configuration structure.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub auth: AuthConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

/// Storage backend selection.
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    /// `sqlite` or `memory`.
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Database file path for the sqlite backend.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_db_path(),
        }
    }
}

fn default_backend() -> String {
    "sqlite".to_string()
}

fn default_db_path() -> String {
    "grendel.db".to_string()
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Authentication bootstrap settings.
#[derive(Debug, Default, Deserialize)]
pub struct AuthConfig {
    /// Initial Admin password; a random one is generated (and logged)
    /// when unset and no Admin user exists yet.
    pub admin_password: Option<String>,
}
