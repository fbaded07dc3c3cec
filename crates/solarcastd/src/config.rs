//! Configuration file parsing and structures.
//!
//! solarcastd reads a single TOML file. Every section is optional; an empty
//! file starts the daemon with forecasting disabled and no seeded assets.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;

use crate::asset::Asset;
use crate::forecast::DEFAULT_BASE_URL;

/// Environment variable consulted when the config file has no API key
pub const API_KEY_ENV: &str = "FORECAST_SOLAR_API_KEY";

pub const DEFAULT_API_PORT: u16 = 8566;

/// Top-level configuration structure
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub forecast: ForecastConfig,

    /// HTTP API, disabled when the section is missing
    #[serde(default)]
    pub api: Option<ApiConfig>,

    /// Assets loaded into the in-memory store at startup
    #[serde(default)]
    pub assets: Vec<Asset>,
}

#[derive(
    Debug,
    Default,
    Deserialize,
    Serialize,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub level: LogLevel,

    /// Per-target levels, e.g. `"solarcastd::forecast" = "debug"`
    #[serde(default)]
    pub overrides: HashMap<String, LogLevel>,
}

impl LoggingConfig {
    /// Build the target filter for the subscriber
    pub fn targets(&self) -> Targets {
        self.overrides
            .iter()
            .fold(Targets::new().with_default(self.level), |t, (target, level)| {
                t.with_target(target.clone(), *level)
            })
    }
}

/// forecast.solar access
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ForecastConfig {
    /// Personal API key. Forecasting is disabled without one.
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
        }
    }
}

impl ForecastConfig {
    /// Use `fallback` as the API key if the file didn't set one. Empty keys
    /// count as unset.
    pub fn with_api_key_fallback(mut self, fallback: Option<String>) -> Self {
        let configured = self.api_key.take().filter(|k| !k.trim().is_empty());
        self.api_key = configured.or_else(|| fallback.filter(|k| !k.trim().is_empty()));
        self
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

/// HTTP API server
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_API_PORT
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))?;

        toml::from_str(&contents).map_err(ConfigError::Parse)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
}
