//! Configuration management

use anyhow::{Context, Result};
use pipeliner_api::{ApiConfig, AuthConfig, RestConfig, StreamConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Application configuration, read from `pipeliner.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level
    pub log_level: String,
    /// Log format
    pub log_format: LogFormat,
    /// HTTP server settings
    pub server: RestConfig,
    /// Event stream settings
    pub stream: StreamConfig,
    /// Viewer authorization
    pub auth: AuthConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            server: RestConfig::default(),
            stream: StreamConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Config {
    /// Reads the file at `path`, or returns the defaults when there is none.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            rest: self.server.clone(),
            stream: self.stream.clone(),
            auth: self.auth.clone(),
        }
    }
}
