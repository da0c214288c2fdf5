//! REST API server implementation for the Pipeliner API.

use axum::Router;
use axum::http::{HeaderValue, Method};
use axum::routing::get;
use pipeliner_events::EventBus;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::builds::{AccessPolicy, AllowAll, BearerToken, BuildLookup};
use crate::handler::{EventsState, LAST_EVENT_ID, STREAM_VERSION, stream_build_events};
use crate::types::ApiConfig;
use crate::{ApiErrorKind, ApiResult};

/// Route of the build event stream.
pub const EVENTS_ROUTE: &str = "/api/v1/builds/:build_id/events";

/// Builds the API router.
pub fn router(state: EventsState) -> Router {
    Router::new()
        .route(EVENTS_ROUTE, get(stream_build_events))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::from(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(origin = %origin, "Ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET])
        .allow_headers([LAST_EVENT_ID, axum::http::header::AUTHORIZATION])
        .expose_headers([STREAM_VERSION])
}

/// REST server
pub struct RestServer {
    config: ApiConfig,
    event_bus: Arc<EventBus>,
    builds: Arc<dyn BuildLookup>,
}

impl RestServer {
    pub fn new(config: ApiConfig, event_bus: Arc<EventBus>, builds: Arc<dyn BuildLookup>) -> Self {
        Self {
            config,
            event_bus,
            builds,
        }
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// The configured router, with CORS and request tracing layers.
    pub fn app(&self) -> ApiResult<Router> {
        let stream_version = HeaderValue::from_str(&self.config.stream.protocol_version)
            .map_err(|_| {
                ApiErrorKind::InvalidConfig(format!(
                    "stream protocol version {:?} is not a valid header value",
                    self.config.stream.protocol_version
                ))
            })?;

        let access: Arc<dyn AccessPolicy> = match &self.config.auth.token {
            Some(token) => Arc::new(BearerToken::new(token.clone())),
            None => Arc::new(AllowAll),
        };

        let app = router(EventsState {
            bus: Arc::clone(&self.event_bus),
            builds: Arc::clone(&self.builds),
            access,
            stream_version,
        })
        .layer(TraceLayer::new_for_http());

        Ok(if self.config.rest.cors_enabled {
            app.layer(cors_layer(&self.config.rest.cors_origins))
        } else {
            app
        })
    }

    /// Serves until `shutdown` resolves, then drains every event stream.
    pub async fn serve<F>(&self, shutdown: F) -> ApiResult
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr: SocketAddr = format!("{}:{}", self.config.rest.host, self.config.rest.port)
            .parse()
            .map_err(|e| ApiErrorKind::InvalidConfig(format!("invalid listen address: {e}")))?;

        let app = self.app()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("REST API server listening on {}", listener.local_addr()?);

        // Live streams only end once drained; graceful shutdown waits on them.
        let bus = Arc::clone(&self.event_bus);
        let signal = async move {
            shutdown.await;
            info!("Shutdown requested; draining event streams");
            bus.drain().await;
        };

        axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await?;

        info!("REST API server stopped");
        Ok(())
    }
}
