//! Transport feeding an in-process channel.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{SinkError, Transport};
use crate::types::Envelope;

/// Sends envelopes into a tokio channel; the receiving half is read by a
/// live [`Subscription`](crate::Subscription).
///
/// Closing is dropping: once the owning [`RawSink`](super::RawSink) lets go
/// of the transport, the receiver observes the end of the channel.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<Envelope>,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, envelope: Envelope) -> Result<(), SinkError> {
        self.tx
            .send(envelope)
            .await
            .map_err(|_| SinkError::Transport("subscriber went away".to_string()))
    }

    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }
}
