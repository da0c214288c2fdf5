//! # Pipeliner API
//!
//! REST API layer for Pipeliner.
//!
//! ## Architecture
//!
//! The API crate provides:
//!
//! - `handler`: Resumable build event streams over server-sent events
//! - `sse`: Frame encoder and incremental decoder
//! - `builds`: Build lookup and access policy collaborators
//! - `rest`: Router and REST server with graceful drain
//! - `types`: API configuration
//!
//! ## Example
//!
//! ```rust,ignore
//! use pipeliner_api::{ApiConfig, InMemoryBuilds, RestServer};
//! use pipeliner_events::{EventBus, InMemoryEventStore};
//!
//! let bus = Arc::new(EventBus::new(Arc::new(InMemoryEventStore::new())));
//! let server = RestServer::new(ApiConfig::default(), bus, Arc::new(InMemoryBuilds::new()));
//! server.serve(shutdown_signal()).await?;
//! ```

#![warn(missing_docs)]
#![warn(unused)]

pub mod builds;
pub mod handler;
pub mod rest;
pub mod sse;
pub mod types;

pub use builds::{AccessPolicy, AllowAll, BearerToken, BuildInfo, BuildLookup, InMemoryBuilds};
pub use handler::{EventsState, StreamError, stream_build_events};
pub use rest::{EVENTS_ROUTE, RestServer, router};
pub use sse::{SseFrame, SseReader};
pub use types::{ApiConfig, AuthConfig, RestConfig, StreamConfig};

/// API errors
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ApiError(#[from] ApiErrorKind);

#[derive(Debug, thiserror::Error)]
pub enum ApiErrorKind {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("events error: {0}")]
    Events(#[from] pipeliner_events::EventsError),
}

impl From<std::io::Error> for ApiError {
    fn from(e: std::io::Error) -> Self {
        Self(ApiErrorKind::Io(e))
    }
}

impl From<pipeliner_events::EventsError> for ApiError {
    fn from(e: pipeliner_events::EventsError) -> Self {
        Self(ApiErrorKind::Events(e))
    }
}

/// Result type for API operations
pub type ApiResult<T = ()> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_config_default() {
        let config = ApiConfig::default();
        assert_eq!(config.rest.port, 8080);
        assert_eq!(config.stream.protocol_version, "2.0");
        assert!(config.auth.token.is_none());
    }

    #[test]
    fn test_io_error_converts() {
        let err: ApiError = std::io::Error::other("boom").into();
        assert_eq!(err.to_string(), "I/O error: boom");
    }
}
