//! Event bus implementation.
//!
//! [`EventBus`] is the producer-facing entry point: it appends every event to
//! the store and broadcasts the resulting envelope to the build's live
//! subscribers. Subscribers obtain a [`Subscription`] that resumes from any
//! sequence number.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, event, Level};

use crate::event_store::{Cursor, EventStore};
use crate::sink::{AsyncSink, AsyncSinkConfig, CensoredSink, ChannelTransport, RawSink, Sink};
use crate::subscription::{Parts, Subscription};
use crate::tracker::{Connection, Tracker};
use crate::types::{BuildId, Envelope, Event, Sequence};
use crate::EventsResult;

/// Publishes build events and hands out subscriptions.
pub struct EventBus {
    store: Arc<dyn EventStore>,
    tracker: Arc<Tracker>,
    sink_config: AsyncSinkConfig,
    /// Serializes append + broadcast per build so live delivery follows
    /// sequence order.
    publishing: DashMap<BuildId, Arc<AsyncMutex<()>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("tracker", &self.tracker)
            .field("sink_config", &self.sink_config)
            .finish_non_exhaustive()
    }
}

impl EventBus {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self::with_config(store, AsyncSinkConfig::default())
    }

    pub fn with_config(store: Arc<dyn EventStore>, sink_config: AsyncSinkConfig) -> Self {
        let tracker = Arc::new(Tracker::new(Arc::clone(&store)));
        Self {
            store,
            tracker,
            sink_config,
            publishing: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    fn publish_lock(&self, build: BuildId) -> Arc<AsyncMutex<()>> {
        Arc::clone(self.publishing.entry(build).or_default().value())
    }

    /// Prepares the store for a new build.
    pub async fn start(&self, build: BuildId) -> EventsResult {
        self.store.initialize(build).await?;
        debug!(build_id = %build, "Build started");
        Ok(())
    }

    /// Appends an event and delivers it to live subscribers.
    pub async fn publish(&self, build: BuildId, event: impl Into<Event>) -> EventsResult<Envelope> {
        let lock = self.publish_lock(build);
        let _guard = lock.lock().await;

        let envelope = self.store.append(build, event.into()).await?;
        event!(
            Level::TRACE,
            build_id = %build,
            sequence = envelope.sequence,
            event_type = %envelope.event_type,
            "Published event"
        );

        if let Some(fanout) = self.tracker.lookup(build) {
            fanout.broadcast(&envelope).await;
        }

        Ok(envelope)
    }

    /// Records that a build has produced its last event.
    ///
    /// Live subscribers receive whatever is left and then end normally.
    pub async fn finish(&self, build: BuildId) -> EventsResult {
        let lock = self.publish_lock(build);
        let result = {
            let _guard = lock.lock().await;
            self.store.finalize(build).await
        };

        if result.is_ok() {
            if let Some(fanout) = self.tracker.lookup(build) {
                fanout.finish().await;
            }
        }
        self.publishing.remove(&build);
        result?;

        event!(Level::INFO, build_id = %build, "Build event stream finished");
        Ok(())
    }

    /// Subscribes to a build from `from` onwards, backfilling from the store.
    ///
    /// With `censored`, credential-bearing fields are stripped before the
    /// envelopes reach the subscriber.
    pub async fn subscribe(
        &self,
        build: BuildId,
        from: Sequence,
        censored: bool,
    ) -> EventsResult<Subscription> {
        // The live channel only bridges the delivery task and the reader;
        // buffering happens in the async sink.
        let (transport, receiver) = ChannelTransport::new(1);
        let raw = RawSink::new(transport);
        let pipeline: Arc<dyn Sink> = if censored {
            Arc::new(AsyncSink::new(CensoredSink::new(raw), self.sink_config.clone()))
        } else {
            Arc::new(AsyncSink::new(raw, self.sink_config.clone()))
        };

        let connection = Connection::new(pipeline);
        let fanout = self.tracker.register(build, connection.clone()).await;
        let sink_id = fanout.attach_from(Arc::new(connection.clone()), from);

        debug!(build_id = %build, from, censored, connection = %connection.id(), "New subscription");

        Ok(Subscription::new(Parts {
            build,
            from,
            receiver,
            censored,
            fanout,
            sink_id,
            connection,
            tracker: Arc::clone(&self.tracker),
            store: Arc::clone(&self.store),
        }))
    }

    /// Reads a finished build's envelopes straight from the store.
    pub async fn replay(&self, build: BuildId, from: Sequence) -> EventsResult<Box<dyn Cursor>> {
        Ok(self.store.read_from(build, from).await?)
    }

    /// Closes every live subscription and rejects new ones.
    pub async fn drain(&self) {
        self.tracker.drain().await;
    }
}
