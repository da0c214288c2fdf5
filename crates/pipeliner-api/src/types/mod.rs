//! API types and configuration for the Pipeliner REST API.

use pipeliner_events::AsyncSinkConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// API configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub rest: RestConfig,
    pub stream: StreamConfig,
    pub auth: AuthConfig,
}

/// REST configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestConfig {
    pub port: u16,
    pub host: String,
    pub cors_enabled: bool,
    pub cors_origins: Vec<String>,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
            cors_enabled: true,
            cors_origins: vec!["*".to_string()],
        }
    }
}

/// Event stream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// How long a subscriber may stall before it is dropped.
    pub slow_consumer_timeout_ms: u64,
    /// Envelopes buffered per subscriber.
    pub sink_queue_capacity: usize,
    /// Value of the stream version response header.
    pub protocol_version: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            slow_consumer_timeout_ms: 10_000,
            sink_queue_capacity: 64,
            protocol_version: "2.0".to_string(),
        }
    }
}

impl StreamConfig {
    pub fn sink_config(&self) -> AsyncSinkConfig {
        AsyncSinkConfig {
            timeout: Duration::from_millis(self.slow_consumer_timeout_ms),
            capacity: self.sink_queue_capacity,
        }
    }
}

/// Authorization configuration
///
/// Without a token every viewer sees unredacted events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub token: Option<String>,
}
