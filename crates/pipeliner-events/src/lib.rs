//! # Pipeliner Events
//!
//! Build event bus for Pipeliner.
//!
//! ## Architecture
//!
//! The events crate provides:
//!
//! - `types`: Envelopes, typed build events and legacy log conversion
//! - `event_store`: Append-only per-build storage with resumable cursors
//! - `sink`: Subscriber delivery pipelines (raw, censored, async)
//! - `fanout`: Live broadcast of one build's envelopes to its sinks
//! - `tracker`: Build -> fanout registry with shutdown drain
//! - `event_bus`: Producer entry point and subscriptions
//!
//! ## Example
//!
//! ```rust,ignore
//! use pipeliner_events::{BuildId, EventBus, InMemoryEventStore, BuildEvent, BuildStatus};
//!
//! let bus = EventBus::new(Arc::new(InMemoryEventStore::new()));
//! let mut subscription = bus.subscribe(BuildId(1), 0, true).await?;
//! bus.publish(BuildId(1), BuildEvent::Status { status: BuildStatus::Started }).await?;
//! ```

#![warn(missing_docs)]
#![warn(unused)]

pub mod event_bus;
pub mod event_store;
pub mod fanout;
pub mod sink;
pub mod subscription;
pub mod tracker;
pub mod types;

pub use event_bus::EventBus;
pub use event_store::{Cursor, EventStore, EventStoreError, InMemoryEventStore};
pub use fanout::{Fanout, FanoutError, SinkId};
pub use sink::{
    AsyncSink, AsyncSinkConfig, Censor, CensoredSink, ChannelTransport, JsonTransport, RawSink,
    Sink, SinkError, Transport,
};
pub use subscription::{Subscription, SubscriptionError};
pub use tracker::{Connection, Tracker};
pub use types::{
    BuildEvent, BuildId, BuildStatus, Envelope, Event, EventType, EventVersion,
    LEGACY_CHUNK_SIZE, LogSource, Message, Origin, OwnedMessage, ResourcePlan, Sequence,
    chunk_legacy_log,
};

/// Event errors
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct EventsError(#[from] EventsErrorKind);

impl EventsError {
    pub fn kind(&self) -> &EventsErrorKind {
        &self.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventsErrorKind {
    #[error("event store error: {0}")]
    EventStore(#[from] EventStoreError),

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("fanout error: {0}")]
    Fanout(#[from] FanoutError),

    #[error("subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

macro_rules! events_error_from {
    ($($source:ty),* $(,)?) => {
        $(
            impl From<$source> for EventsError {
                fn from(e: $source) -> Self {
                    Self(EventsErrorKind::from(e))
                }
            }
        )*
    };
}

events_error_from!(
    EventStoreError,
    SinkError,
    FanoutError,
    SubscriptionError,
    serde_json::Error,
);

/// Result type for events operations
pub type EventsResult<T = ()> = Result<T, EventsError>;
