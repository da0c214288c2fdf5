//! Delivery endpoints for build event subscribers.
//!
//! A subscriber's pipeline is composed from decorators around a transport:
//!
//! ```text
//! AsyncSink -> CensoredSink (optional) -> RawSink -> Transport
//! ```
//!
//! - [`RawSink`] forwards envelopes verbatim to a [`Transport`].
//! - [`CensoredSink`] strips credential-bearing fields for viewers that may
//!   not see them.
//! - [`AsyncSink`] decouples the broadcasting producer from a slow consumer
//!   with a bounded queue and a delivery deadline.

mod async_sink;
mod censored;
mod channel;
mod raw;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::types::Envelope;

pub use async_sink::{AsyncSink, AsyncSinkConfig};
pub use censored::{Censor, CensoredSink, SUPPORTED_MAJOR_VERSIONS};
pub use channel::ChannelTransport;
pub use raw::{JsonTransport, RawSink};

/// Delivery endpoint for one subscriber.
///
/// After `close` returns, `deliver` fails with [`SinkError::Closed`].
/// Closing an already closed sink is a no-op.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn deliver(&self, envelope: &Envelope) -> Result<(), SinkError>;

    async fn close(&self) -> Result<(), SinkError>;
}

#[async_trait]
impl<S: Sink + ?Sized> Sink for Arc<S> {
    async fn deliver(&self, envelope: &Envelope) -> Result<(), SinkError> {
        (**self).deliver(envelope).await
    }

    async fn close(&self) -> Result<(), SinkError> {
        (**self).close().await
    }
}

/// The connection a [`RawSink`] writes to.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, envelope: Envelope) -> Result<(), SinkError>;

    async fn close(&self) -> Result<(), SinkError>;
}

/// Sink errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("slow consumer: delivery not accepted within {0:?}")]
    SlowConsumer(Duration),

    #[error("unknown version {version:?} for event {event_type:?}")]
    VersionUnknown { event_type: String, version: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("sink closed")]
    Closed,
}
