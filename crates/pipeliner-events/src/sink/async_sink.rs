//! Buffered sink isolating the broadcaster from slow consumers.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Sink, SinkError};
use crate::types::Envelope;

/// Async sink configuration
#[derive(Debug, Clone)]
pub struct AsyncSinkConfig {
    /// Longest `deliver` waits for queue space before giving up. Also bounds
    /// how long a closed sink keeps flushing its queue.
    pub timeout: Duration,
    /// Envelopes buffered between the broadcaster and the delivery task.
    pub capacity: usize,
}

impl Default for AsyncSinkConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            capacity: 64,
        }
    }
}

/// Queues envelopes for a background task that feeds the inner sink.
///
/// `deliver` only waits for queue space, never for the consumer, and fails
/// with [`SinkError::SlowConsumer`] once `timeout` elapses. After `close` the
/// queued envelopes still go through before the inner sink is closed, unless
/// that takes longer than `timeout`. Dropping an open sink stops the
/// background task.
pub struct AsyncSink {
    tx: Mutex<Option<mpsc::Sender<Envelope>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl AsyncSink {
    /// Wraps `inner` and spawns its delivery task on the current runtime.
    pub fn new<S: Sink + 'static>(inner: S, config: AsyncSinkConfig) -> Self {
        let inner: Arc<dyn Sink> = Arc::new(inner);
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run(inner, rx, cancel.clone()));

        Self {
            tx: Mutex::new(Some(tx)),
            task: Mutex::new(Some(task)),
            timeout: config.timeout,
            cancel,
        }
    }
}

impl std::fmt::Debug for AsyncSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncSink")
            .field("timeout", &self.timeout)
            .field("closed", &self.tx.lock().is_none())
            .finish_non_exhaustive()
    }
}

async fn run(inner: Arc<dyn Sink>, mut rx: mpsc::Receiver<Envelope>, cancel: CancellationToken) {
    loop {
        let envelope = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = inner.deliver(&envelope) => result,
        };

        if let Err(e) = result {
            warn!(sequence = envelope.sequence, error = %e, "Async sink delivery failed");
            break;
        }
    }

    // Stop accepting before releasing the inner sink so `deliver` observes
    // the failure instead of queueing into the void.
    rx.close();
    if let Err(e) = inner.close().await {
        debug!(error = %e, "Closing inner sink failed");
    }
}

#[async_trait]
impl Sink for AsyncSink {
    async fn deliver(&self, envelope: &Envelope) -> Result<(), SinkError> {
        let Some(tx) = self.tx.lock().clone() else {
            return Err(SinkError::Closed);
        };

        match tx.send_timeout(envelope.clone(), self.timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(SinkError::SlowConsumer(self.timeout)),
            Err(SendTimeoutError::Closed(_)) => Err(SinkError::Closed),
        }
    }

    /// Stops accepting envelopes. The task keeps flushing the queue in the
    /// background and then closes the inner sink; it is cancelled if the
    /// flush outlasts `timeout`.
    async fn close(&self) -> Result<(), SinkError> {
        // The task sees the end of the queue once the last sender is gone.
        drop(self.tx.lock().take());

        let Some(mut task) = self.task.lock().take() else {
            return Ok(());
        };

        let (timeout, cancel) = (self.timeout, self.cancel.clone());
        tokio::spawn(async move {
            if tokio::time::timeout(timeout, &mut task).await.is_err() {
                debug!(timeout = ?timeout, "Async sink did not flush in time; cancelling");
                cancel.cancel();
            }
        });
        Ok(())
    }
}

impl Drop for AsyncSink {
    fn drop(&mut self) {
        // Once closed, the flush deadline is already being enforced.
        if self.task.get_mut().is_some() {
            self.cancel.cancel();
        }
    }
}
