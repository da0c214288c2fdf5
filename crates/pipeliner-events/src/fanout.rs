//! Live broadcast point for one build.
//!
//! A [`Fanout`] forwards every newly published envelope to all attached
//! sinks. A sink attaching mid-build is first backfilled from the event store;
//! envelopes broadcast while the backfill runs are buffered for it and
//! replayed afterwards, deduplicated by sequence, before the sink switches to
//! live delivery.
//!
//! All mutation of the sink set happens under one mutex. Broadcasting takes a
//! snapshot of the live sinks and performs delivery outside the lock.

use futures::future::join_all;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::event_store::{EventStore, EventStoreError};
use crate::sink::{Sink, SinkError};
use crate::types::{BuildId, Envelope, Sequence};

/// Identifies a sink attached to a fanout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(Uuid);

impl SinkId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sink-{}", self.0)
    }
}

/// Fanout errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FanoutError {
    #[error("fanout for build {0} already closed")]
    AlreadyClosed(BuildId),
}

enum Delivery {
    /// Backfill in progress; live envelopes wait here.
    CatchingUp(Vec<Envelope>),
    Live,
}

struct Attached {
    id: SinkId,
    sink: Arc<dyn Sink>,
    delivery: Delivery,
}

#[derive(Default)]
struct FanoutState {
    sinks: Vec<Attached>,
    closed: bool,
    finished: bool,
}

/// Broadcasts one build's envelopes to its attached sinks.
pub struct Fanout {
    build: BuildId,
    store: Arc<dyn EventStore>,
    state: Mutex<FanoutState>,
}

impl fmt::Debug for Fanout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Fanout")
            .field("build", &self.build)
            .field("sinks", &state.sinks.len())
            .field("closed", &state.closed)
            .field("finished", &state.finished)
            .finish()
    }
}

impl Fanout {
    pub fn new(build: BuildId, store: Arc<dyn EventStore>) -> Self {
        Self {
            build,
            store,
            state: Mutex::new(FanoutState::default()),
        }
    }

    /// A fanout that is already closed; attached sinks are closed at once.
    pub fn closed(build: BuildId, store: Arc<dyn EventStore>) -> Self {
        Self {
            build,
            store,
            state: Mutex::new(FanoutState {
                closed: true,
                ..FanoutState::default()
            }),
        }
    }

    pub fn build(&self) -> BuildId {
        self.build
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// True once the build has produced its last event.
    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    pub fn sink_count(&self) -> usize {
        self.state.lock().sinks.len()
    }

    /// Attaches a sink and backfills everything the build produced so far.
    pub fn attach(self: &Arc<Self>, sink: Arc<dyn Sink>) -> SinkId {
        self.attach_from(sink, 0)
    }

    /// Attaches a sink that wants envelopes from `from` onwards.
    ///
    /// The backfill runs on its own task and does not hold up broadcasts to
    /// other sinks.
    pub fn attach_from(self: &Arc<Self>, sink: Arc<dyn Sink>, from: Sequence) -> SinkId {
        let id = SinkId::new();

        let accepted = {
            let mut state = self.state.lock();
            if state.closed {
                false
            } else {
                state.sinks.push(Attached {
                    id,
                    sink: Arc::clone(&sink),
                    delivery: Delivery::CatchingUp(Vec::new()),
                });
                true
            }
        };

        if accepted {
            debug!(build_id = %self.build, sink = %id, from, "Attached sink");
            tokio::spawn(Arc::clone(self).backfill(id, sink, from));
        } else {
            debug!(build_id = %self.build, sink = %id, "Attach to closed fanout");
            tokio::spawn(async move {
                let _ = sink.close().await;
            });
        }

        id
    }

    /// Removes a sink without closing it.
    pub fn detach(&self, id: SinkId) -> Option<Arc<dyn Sink>> {
        let mut state = self.state.lock();
        let idx = state.sinks.iter().position(|a| a.id == id)?;
        Some(state.sinks.swap_remove(idx).sink)
    }

    /// Delivers an envelope to every live sink; sinks that fail are dropped.
    pub async fn broadcast(&self, envelope: &Envelope) {
        let live: Vec<(SinkId, Arc<dyn Sink>)> = {
            let mut state = self.state.lock();
            if state.closed || state.finished {
                return;
            }

            state
                .sinks
                .iter_mut()
                .filter_map(|attached| match &mut attached.delivery {
                    Delivery::CatchingUp(pending) => {
                        pending.push(envelope.clone());
                        None
                    }
                    Delivery::Live => Some((attached.id, Arc::clone(&attached.sink))),
                })
                .collect()
        };

        let results = join_all(
            live.iter()
                .map(|(id, sink)| async move { (*id, sink.deliver(envelope).await) }),
        )
        .await;

        for (id, result) in results {
            if let Err(e) = result {
                self.evict(id, &e).await;
            }
        }
    }

    /// Closes every attached sink and stops all further delivery.
    ///
    /// Closing twice is an error; callers that may race should ignore
    /// [`FanoutError::AlreadyClosed`].
    pub async fn close(&self) -> Result<(), FanoutError> {
        let sinks = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(FanoutError::AlreadyClosed(self.build));
            }
            state.closed = true;
            std::mem::take(&mut state.sinks)
        };

        debug!(build_id = %self.build, sinks = sinks.len(), "Closing fanout");
        close_all(sinks).await;
        Ok(())
    }

    /// Marks the build as finished and closes its live sinks.
    ///
    /// Sinks still catching up are closed by their own backfill once it has
    /// delivered everything. Subscribers distinguish this from
    /// [`Fanout::close`] through [`Fanout::is_finished`] and read any
    /// remaining tail from the store.
    pub async fn finish(&self) {
        let sinks = {
            let mut state = self.state.lock();
            if state.closed || state.finished {
                return;
            }
            state.finished = true;
            take_live(&mut state.sinks)
        };

        debug!(build_id = %self.build, sinks = sinks.len(), "Build finished; releasing sinks");
        close_all(sinks).await;
    }

    /// Removes and closes one sink after its backfill reached the end of a
    /// finished build, together with any live sinks `finish` has not seen.
    async fn release_finished(&self, id: SinkId) {
        let sinks = {
            let mut state = self.state.lock();
            state.finished = true;
            let (released, kept) = std::mem::take(&mut state.sinks)
                .into_iter()
                .partition(|a| a.id == id || matches!(a.delivery, Delivery::Live));
            state.sinks = kept;
            released
        };
        close_all(sinks).await;
    }

    async fn evict(&self, id: SinkId, error: &SinkError) {
        let Some(sink) = self.detach(id) else {
            return;
        };

        warn!(build_id = %self.build, sink = %id, error = %error, "Dropping sink from fanout");
        if let Err(e) = sink.close().await {
            debug!(sink = %id, error = %e, "Closing evicted sink failed");
        }
    }

    async fn backfill(self: Arc<Self>, id: SinkId, sink: Arc<dyn Sink>, from: Sequence) {
        let finalized = matches!(self.store.is_finalized(self.build).await, Ok(true));

        let mut next = from;
        if let Err(e) = self.backfill_from_store(&sink, &mut next).await {
            self.evict(id, &e).await;
            return;
        }

        if finalized {
            // Nothing more will be appended; the store gave us everything.
            self.release_finished(id).await;
            return;
        }

        loop {
            let pending = {
                let mut state = self.state.lock();
                let finished = state.finished;
                let Some(attached) = state.sinks.iter_mut().find(|a| a.id == id) else {
                    return;
                };

                let pending = match &mut attached.delivery {
                    Delivery::Live => return,
                    Delivery::CatchingUp(pending) => std::mem::take(pending),
                };

                if pending.is_empty() && !finished {
                    attached.delivery = Delivery::Live;
                    debug!(build_id = %self.build, sink = %id, next, "Sink caught up");
                    return;
                }

                pending
            };

            if pending.is_empty() {
                debug!(build_id = %self.build, sink = %id, next, "Sink caught up with finished build");
                self.release_finished(id).await;
                return;
            }

            for envelope in pending {
                if envelope.sequence < next {
                    continue;
                }
                if let Err(e) = sink.deliver(&envelope).await {
                    self.evict(id, &e).await;
                    return;
                }
                next = envelope.sequence + 1;
            }
        }
    }

    async fn backfill_from_store(
        &self,
        sink: &Arc<dyn Sink>,
        next: &mut Sequence,
    ) -> Result<(), SinkError> {
        let mut cursor = match self.store.read_from(self.build, *next).await {
            Ok(cursor) => cursor,
            // Nothing appended yet.
            Err(EventStoreError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(SinkError::Transport(e.to_string())),
        };

        let result = loop {
            match cursor.next().await {
                Ok(Some(envelope)) => {
                    if envelope.sequence < *next {
                        continue;
                    }
                    if let Err(e) = sink.deliver(&envelope).await {
                        break Err(e);
                    }
                    *next = envelope.sequence + 1;
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(SinkError::Transport(e.to_string())),
            }
        };

        let _ = cursor.close().await;
        result
    }
}

fn take_live(sinks: &mut Vec<Attached>) -> Vec<Attached> {
    let (live, catching_up) = std::mem::take(sinks)
        .into_iter()
        .partition(|a| matches!(a.delivery, Delivery::Live));
    *sinks = catching_up;
    live
}

async fn close_all(sinks: Vec<Attached>) {
    join_all(sinks.into_iter().map(|attached| async move {
        if let Err(e) = attached.sink.close().await {
            debug!(sink = %attached.id, error = %e, "Closing sink failed");
        }
    }))
    .await;
}
