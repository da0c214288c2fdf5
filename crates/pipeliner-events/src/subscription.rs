//! Live subscriptions to a build's event stream.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::event_store::{Cursor, EventStore, EventStoreError};
use crate::fanout::{Fanout, SinkId};
use crate::sink::{Censor, Sink};
use crate::tracker::{Connection, Tracker};
use crate::types::{BuildId, Envelope, Sequence};

/// Subscription errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    /// The stream was cut before the build finished, by a drain or because
    /// the subscriber fell behind.
    #[error("subscription to build {0} terminated")]
    Terminated(BuildId),

    #[error("event store error: {0}")]
    Store(#[from] EventStoreError),
}

enum State {
    Live(mpsc::Receiver<Envelope>),
    /// Build finished; reading what the live channel did not carry.
    Tail(Box<dyn Cursor>),
    Ended,
    Terminated,
}

/// A subscriber's view of one build, from a starting sequence onwards.
///
/// Yields envelopes in strictly increasing sequence order with no gaps.
/// `next` returns `Ok(None)` once the build has finished and everything was
/// delivered. Dropping the subscription detaches it from the build.
pub struct Subscription {
    build: BuildId,
    next: Sequence,
    state: State,
    censor: Option<Censor>,
    fanout: Arc<Fanout>,
    sink_id: SinkId,
    connection: Connection,
    tracker: Arc<Tracker>,
    store: Arc<dyn EventStore>,
    released: bool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("build", &self.build)
            .field("next", &self.next)
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

pub(crate) struct Parts {
    pub build: BuildId,
    pub from: Sequence,
    pub receiver: mpsc::Receiver<Envelope>,
    pub censored: bool,
    pub fanout: Arc<Fanout>,
    pub sink_id: SinkId,
    pub connection: Connection,
    pub tracker: Arc<Tracker>,
    pub store: Arc<dyn EventStore>,
}

impl Subscription {
    pub(crate) fn new(parts: Parts) -> Self {
        Self {
            build: parts.build,
            next: parts.from,
            state: State::Live(parts.receiver),
            censor: parts.censored.then(Censor::new),
            fanout: parts.fanout,
            sink_id: parts.sink_id,
            connection: parts.connection,
            tracker: parts.tracker,
            store: parts.store,
            released: false,
        }
    }

    pub fn build(&self) -> BuildId {
        self.build
    }

    /// Sequence of the next envelope this subscription will yield.
    pub fn position(&self) -> Sequence {
        self.next
    }

    pub async fn next(&mut self) -> Result<Option<Envelope>, SubscriptionError> {
        loop {
            match &mut self.state {
                State::Live(receiver) => match receiver.recv().await {
                    Some(envelope) => {
                        if envelope.sequence < self.next {
                            continue;
                        }
                        if let Some(censor) = self.censor.as_mut() {
                            censor.observe(&envelope.version);
                        }
                        self.next = envelope.sequence + 1;
                        return Ok(Some(envelope));
                    }
                    None if self.fanout.is_finished() => {
                        let cursor = self.store.read_from(self.build, self.next).await?;
                        self.state = State::Tail(cursor);
                    }
                    None => {
                        debug!(build_id = %self.build, next = self.next, "Live channel closed before build finished");
                        self.state = State::Terminated;
                        self.release();
                    }
                },
                State::Tail(cursor) => match cursor.next().await? {
                    Some(envelope) => {
                        self.next = envelope.sequence + 1;
                        let envelope = match self.censor.as_mut() {
                            Some(censor) => match censor.apply(&envelope) {
                                Ok(censored) => censored,
                                Err(e) => {
                                    debug!(build_id = %self.build, error = %e, "Cannot censor tail envelope");
                                    self.state = State::Terminated;
                                    self.release();
                                    continue;
                                }
                            },
                            None => envelope,
                        };
                        return Ok(Some(envelope));
                    }
                    None => {
                        let _ = cursor.close().await;
                        self.state = State::Ended;
                        self.release();
                    }
                },
                State::Ended => return Ok(None),
                State::Terminated => return Err(SubscriptionError::Terminated(self.build)),
            }
        }
    }

    /// Detaches from the build and closes the delivery pipeline.
    pub async fn close(mut self) {
        self.release();
        let _ = self.connection.close().await;
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.fanout.detach(self.sink_id);
        self.tracker.unregister(self.build, &self.connection);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
