//! Resumable build event stream handler.
//!
//! `GET /api/v1/builds/{build_id}/events` streams a build's envelopes as
//! server-sent events. A client that lost its connection reconnects with
//! `Last-Event-ID` set to the last sequence it processed and continues from
//! the next one.
//!
//! A request moves through `Initial -> LiveTail | Replay -> Ended`. All
//! failures in `Initial` become a status code; once the first byte is out,
//! failures only end the connection.

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::stream;
use pipeliner_events::{
    BuildId, Censor, Cursor, Envelope, EventBus, EventStoreError, EventsError, EventsErrorKind,
    Sequence, Subscription,
};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::builds::{AccessPolicy, BuildLookup};
use crate::sse;

/// Request header carrying the resume position.
pub const LAST_EVENT_ID: HeaderName = HeaderName::from_static("last-event-id");

/// Response header naming the envelope wire format version.
pub const STREAM_VERSION: HeaderName = HeaderName::from_static("x-pipeliner-stream-version");

pub(crate) const CONTENT_TYPE: &str = "text/event-stream; charset=utf-8";
pub(crate) const CACHE_CONTROL: &str = "no-cache, no-store, must-revalidate";

/// Shared state of the events endpoint.
#[derive(Clone)]
pub struct EventsState {
    pub bus: Arc<EventBus>,
    pub builds: Arc<dyn BuildLookup>,
    pub access: Arc<dyn AccessPolicy>,
    pub stream_version: HeaderValue,
}

/// Errors raised before streaming starts.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("malformed Last-Event-ID header: {0:?}")]
    MalformedLastEventId(String),

    #[error("build not found: {0}")]
    BuildNotFound(BuildId),

    #[error("server is shutting down")]
    Draining,

    #[error("cannot open event stream: {0}")]
    Source(#[from] EventsError),
}

impl StreamError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MalformedLastEventId(_) => StatusCode::BAD_REQUEST,
            Self::BuildNotFound(_) => StatusCode::NOT_FOUND,
            Self::Draining => StatusCode::SERVICE_UNAVAILABLE,
            Self::Source(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for StreamError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "Rejecting event stream request");
        } else {
            debug!(error = %self, "Rejecting event stream request");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Resume position: `Last-Event-ID + 1`, or 0 without the header.
pub fn resume_position(headers: &HeaderMap) -> Result<Sequence, StreamError> {
    let Some(value) = headers.get(&LAST_EVENT_ID) else {
        return Ok(0);
    };

    let raw = value.to_str().map_err(|_| {
        StreamError::MalformedLastEventId(String::from_utf8_lossy(value.as_bytes()).into_owned())
    })?;

    raw.trim()
        .parse::<Sequence>()
        .ok()
        .and_then(|last| last.checked_add(1))
        .ok_or_else(|| StreamError::MalformedLastEventId(raw.to_string()))
}

/// Where a stream's envelopes come from.
enum Phase {
    /// Build still running: live subscription with store backfill.
    LiveTail(Subscription),
    /// Build finished: read straight from the store.
    Replay {
        cursor: Option<Box<dyn Cursor>>,
        censor: Option<Censor>,
    },
    Ended,
}

#[derive(Debug, thiserror::Error)]
enum PhaseError {
    #[error(transparent)]
    Events(#[from] EventsError),

    #[error(transparent)]
    Censor(#[from] pipeliner_events::SinkError),
}

impl Phase {
    async fn next(&mut self) -> Result<Option<Envelope>, PhaseError> {
        match self {
            Self::LiveTail(subscription) => Ok(subscription.next().await.map_err(EventsError::from)?),
            Self::Replay { cursor: None, .. } => Ok(None),
            Self::Replay {
                cursor: Some(cursor),
                censor,
            } => {
                let Some(envelope) = cursor.next().await.map_err(EventsError::from)? else {
                    let _ = cursor.close().await;
                    return Ok(None);
                };
                match censor {
                    Some(censor) => Ok(Some(censor.apply(&envelope)?)),
                    None => Ok(Some(envelope)),
                }
            }
            Self::Ended => Ok(None),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::LiveTail(_) => "live",
            Self::Replay { .. } => "replay",
            Self::Ended => "ended",
        }
    }
}

/// One client's stream.
struct EventStream {
    build: BuildId,
    phase: Phase,
    shutdown: CancellationToken,
    sent: u64,
}

impl EventStream {
    /// Next chunk of the response body; `None` ends the connection.
    async fn next_frame(&mut self) -> Option<Bytes> {
        if matches!(self.phase, Phase::Ended) {
            return None;
        }

        let next = tokio::select! {
            biased;
            () = self.shutdown.cancelled() => None,
            next = self.phase.next() => Some(next),
        };

        let Some(next) = next else {
            info!(build_id = %self.build, sent = self.sent, "Closing event stream for shutdown");
            self.phase = Phase::Ended;
            return None;
        };

        match next {
            Ok(Some(envelope)) => match sse::encode_envelope(&envelope) {
                Ok(frame) => {
                    self.sent += 1;
                    Some(frame)
                }
                Err(e) => {
                    error!(build_id = %self.build, sequence = envelope.sequence, error = %e, "Cannot encode envelope");
                    self.phase = Phase::Ended;
                    None
                }
            },
            Ok(None) => {
                debug!(build_id = %self.build, mode = self.phase.name(), sent = self.sent, "Event stream complete");
                self.phase = Phase::Ended;
                Some(sse::end_frame())
            }
            Err(e) => {
                warn!(build_id = %self.build, mode = self.phase.name(), error = %e, "Event stream terminated");
                self.phase = Phase::Ended;
                None
            }
        }
    }

    fn into_body(self) -> Body {
        Body::from_stream(stream::unfold(self, |mut stream| async move {
            let frame = stream.next_frame().await?;
            Some((Ok::<_, Infallible>(frame), stream))
        }))
    }
}

/// `GET /api/v1/builds/{build_id}/events`
pub async fn stream_build_events(
    State(state): State<EventsState>,
    Path(build_id): Path<u64>,
    headers: HeaderMap,
) -> Result<Response, StreamError> {
    let build = BuildId(build_id);
    let from = resume_position(&headers)?;

    let info = state
        .builds
        .find_build(build)
        .await
        .ok_or(StreamError::BuildNotFound(build))?;

    let tracker = state.bus.tracker();
    if tracker.is_draining() {
        return Err(StreamError::Draining);
    }

    let censored = state.access.requires_censoring(&info, &headers);
    let phase = if info.is_running() {
        Phase::LiveTail(state.bus.subscribe(build, from, censored).await?)
    } else {
        let cursor = match state.bus.replay(build, from).await {
            Ok(cursor) => Some(cursor),
            // Finished without ever producing an event.
            Err(e) if matches!(e.kind(), EventsErrorKind::EventStore(EventStoreError::NotFound(_))) => None,
            Err(e) => return Err(e.into()),
        };
        Phase::Replay {
            cursor,
            censor: censored.then(Censor::new),
        }
    };

    debug!(build_id = %build, from, censored, mode = phase.name(), "Streaming build events");

    let stream = EventStream {
        build,
        phase,
        shutdown: tracker.shutdown_token(),
        sent: 0,
    };

    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE)),
            (header::CACHE_CONTROL, HeaderValue::from_static(CACHE_CONTROL)),
            (STREAM_VERSION, state.stream_version.clone()),
        ],
        stream.into_body(),
    )
        .into_response())
}
