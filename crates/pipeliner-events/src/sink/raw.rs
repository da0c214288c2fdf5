//! Passthrough sink and the JSON writer transport.

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use super::{Sink, SinkError, Transport};
use crate::types::Envelope;

/// Forwards envelopes unchanged to its transport.
///
/// The transport is closed at most once; in-flight deliveries finish before
/// `close` proceeds.
pub struct RawSink<T> {
    transport: Mutex<Option<T>>,
}

impl<T: Transport> RawSink<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport: Mutex::new(Some(transport)),
        }
    }
}

impl<T> std::fmt::Debug for RawSink<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawSink").finish_non_exhaustive()
    }
}

#[async_trait]
impl<T: Transport> Sink for RawSink<T> {
    async fn deliver(&self, envelope: &Envelope) -> Result<(), SinkError> {
        let guard = self.transport.lock().await;
        match guard.as_ref() {
            Some(transport) => transport.send(envelope.clone()).await,
            None => Err(SinkError::Closed),
        }
    }

    async fn close(&self) -> Result<(), SinkError> {
        let transport = self.transport.lock().await.take();
        match transport {
            Some(transport) => transport.close().await,
            None => Ok(()),
        }
    }
}

/// Writes each envelope as one line of wire JSON.
pub struct JsonTransport<W> {
    writer: Mutex<W>,
}

impl<W> JsonTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl<W> Transport for JsonTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, envelope: Envelope) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(&envelope.message())
            .map_err(|e| SinkError::Transport(e.to_string()))?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(&line)
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.writer
            .lock()
            .await
            .shutdown()
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))
    }
}
