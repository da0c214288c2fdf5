//! Registry of builds with live subscribers.
//!
//! The tracker owns one [`Fanout`] per build that currently has at least one
//! connection, reference counted by those connections. On shutdown,
//! [`Tracker::drain`] closes every fanout and connection and refuses new
//! registrations.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::event_store::EventStore;
use crate::fanout::Fanout;
use crate::sink::{Sink, SinkError};
use crate::types::{BuildId, Envelope};

struct ConnectionInner {
    sink: Arc<dyn Sink>,
    closed: AtomicBool,
}

/// One client's subscription pipeline, shared by the tracker and the fanout.
///
/// Clones refer to the same connection. The underlying sink is closed at most
/// once no matter how many holders close it.
#[derive(Clone)]
pub struct Connection {
    id: Uuid,
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        Self {
            id: Uuid::new_v4(),
            inner: Arc::new(ConnectionInner {
                sink,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl Sink for Connection {
    async fn deliver(&self, envelope: &Envelope) -> Result<(), SinkError> {
        if self.is_closed() {
            return Err(SinkError::Closed);
        }
        self.inner.sink.deliver(envelope).await
    }

    async fn close(&self) -> Result<(), SinkError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.sink.close().await
    }
}

struct Tracked {
    fanout: Arc<Fanout>,
    connections: Vec<Connection>,
}

#[derive(Default)]
struct TrackerState {
    builds: HashMap<BuildId, Tracked>,
    draining: bool,
}

/// Build -> fanout registry
pub struct Tracker {
    store: Arc<dyn EventStore>,
    state: Mutex<TrackerState>,
    shutdown: CancellationToken,
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Tracker")
            .field("builds", &state.builds.len())
            .field("draining", &state.draining)
            .finish()
    }
}

impl Tracker {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            state: Mutex::new(TrackerState::default()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Registers a connection for a build and returns the build's fanout.
    ///
    /// While draining, the connection is closed immediately and a closed
    /// fanout is returned instead.
    pub async fn register(&self, build: BuildId, connection: Connection) -> Arc<Fanout> {
        let fanout = {
            let mut state = self.state.lock();
            if state.draining {
                None
            } else {
                let tracked = state.builds.entry(build).or_insert_with(|| Tracked {
                    fanout: Arc::new(Fanout::new(build, Arc::clone(&self.store))),
                    connections: Vec::new(),
                });
                tracked.connections.push(connection.clone());
                Some(Arc::clone(&tracked.fanout))
            }
        };

        match fanout {
            Some(fanout) => {
                debug!(build_id = %build, connection = %connection.id(), "Registered connection");
                fanout
            }
            None => {
                debug!(build_id = %build, connection = %connection.id(), "Rejected connection while draining");
                let _ = connection.close().await;
                Arc::new(Fanout::closed(build, Arc::clone(&self.store)))
            }
        }
    }

    /// Drops a connection; the build's fanout is released with its last one.
    pub fn unregister(&self, build: BuildId, connection: &Connection) {
        let mut state = self.state.lock();
        let Some(tracked) = state.builds.get_mut(&build) else {
            return;
        };

        tracked.connections.retain(|c| c.id != connection.id);
        if tracked.connections.is_empty() {
            state.builds.remove(&build);
            debug!(build_id = %build, "Released fanout");
        }
    }

    /// The fanout of a build with live subscribers, if any.
    pub fn lookup(&self, build: BuildId) -> Option<Arc<Fanout>> {
        self.state
            .lock()
            .builds
            .get(&build)
            .map(|tracked| Arc::clone(&tracked.fanout))
    }

    /// Number of connections registered for a build.
    pub fn refcount(&self, build: BuildId) -> usize {
        self.state
            .lock()
            .builds
            .get(&build)
            .map_or(0, |tracked| tracked.connections.len())
    }

    pub fn tracked_builds(&self) -> Vec<BuildId> {
        self.state.lock().builds.keys().copied().collect()
    }

    pub fn is_draining(&self) -> bool {
        self.state.lock().draining
    }

    /// Cancelled once draining starts; streaming handlers select on it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Closes every fanout and connection and rejects later registrations.
    ///
    /// Entries are left in place; their connections unregister themselves as
    /// they wind down.
    pub async fn drain(&self) {
        let tracked: Vec<(Arc<Fanout>, Vec<Connection>)> = {
            let mut state = self.state.lock();
            state.draining = true;
            state
                .builds
                .values()
                .map(|t| (Arc::clone(&t.fanout), t.connections.clone()))
                .collect()
        };

        info!(builds = tracked.len(), "Draining event streams");
        self.shutdown.cancel();

        for (fanout, connections) in tracked {
            if let Err(e) = fanout.close().await {
                debug!(error = %e, "Fanout already closed");
            }
            for connection in connections {
                let _ = connection.close().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventStore;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingSink {
        closes: AtomicUsize,
    }

    #[async_trait]
    impl Sink for CountingSink {
        async fn deliver(&self, _envelope: &Envelope) -> Result<(), SinkError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), SinkError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn tracker() -> Tracker {
        Tracker::new(Arc::new(InMemoryEventStore::new()))
    }

    fn connection() -> (Connection, Arc<CountingSink>) {
        let sink = Arc::new(CountingSink::default());
        (Connection::new(sink.clone()), sink)
    }

    #[tokio::test]
    async fn test_register_shares_fanout() {
        let tracker = tracker();
        let (a, _) = connection();
        let (b, _) = connection();

        let first = tracker.register(BuildId(1), a).await;
        let second = tracker.register(BuildId(1), b).await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(tracker.refcount(BuildId(1)), 2);
        assert_eq!(tracker.tracked_builds(), vec![BuildId(1)]);
    }

    #[tokio::test]
    async fn test_last_unregister_releases_fanout() {
        let tracker = tracker();
        let (a, _) = connection();
        let (b, _) = connection();
        tracker.register(BuildId(1), a.clone()).await;
        tracker.register(BuildId(1), b.clone()).await;

        tracker.unregister(BuildId(1), &a);
        assert_eq!(tracker.refcount(BuildId(1)), 1);
        assert!(tracker.lookup(BuildId(1)).is_some());

        tracker.unregister(BuildId(1), &b);
        assert!(tracker.lookup(BuildId(1)).is_none());
        assert!(tracker.tracked_builds().is_empty());
    }

    #[tokio::test]
    async fn test_unregister_unknown_is_noop() {
        let tracker = tracker();
        let (a, _) = connection();
        tracker.unregister(BuildId(7), &a);
        assert_eq!(tracker.refcount(BuildId(7)), 0);
    }

    #[tokio::test]
    async fn test_drain_closes_each_sink_once() {
        let tracker = tracker();
        let mut sinks = Vec::new();
        let mut fanouts = Vec::new();

        for build in [1, 1, 2] {
            let (conn, sink) = connection();
            let fanout = tracker.register(BuildId(build), conn.clone()).await;
            fanout.attach(Arc::new(conn));
            sinks.push(sink);
            fanouts.push(fanout);
        }
        tokio::task::yield_now().await;

        let token = tracker.shutdown_token();
        tracker.drain().await;

        assert!(token.is_cancelled());
        assert!(tracker.is_draining());
        assert!(fanouts.iter().all(|f| f.is_closed()));
        for sink in &sinks {
            assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_register_after_drain_is_rejected() {
        let tracker = tracker();
        tracker.drain().await;

        let (conn, sink) = connection();
        let fanout = tracker.register(BuildId(1), conn.clone()).await;

        assert!(fanout.is_closed());
        assert!(conn.is_closed());
        assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
        assert!(tracker.lookup(BuildId(1)).is_none());
    }

    #[tokio::test]
    async fn test_connection_closes_inner_once() {
        let (conn, sink) = connection();
        let other = conn.clone();

        conn.close().await.unwrap();
        other.close().await.unwrap();

        assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
        assert_eq!(
            other.deliver(&crate::types::Event::new("fake", "1.0", serde_json::json!({})).sequenced(0)).await,
            Err(SinkError::Closed)
        );
    }
}
