//! In-memory event store for development and testing.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use super::{Cursor, EventStore, EventStoreError};
use crate::types::{BuildId, Envelope, Event, Sequence};

#[derive(Debug, Default)]
struct BuildLog {
    events: Vec<Envelope>,
    finalized: bool,
}

/// In-memory event store
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventStore {
    builds: Arc<DashMap<BuildId, BuildLog>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of envelopes stored for a build, if it exists.
    pub fn len(&self, build: BuildId) -> Option<usize> {
        self.builds.get(&build).map(|log| log.events.len())
    }

    pub fn builds(&self) -> Vec<BuildId> {
        self.builds.iter().map(|e| *e.key()).collect()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn initialize(&self, build: BuildId) -> Result<(), EventStoreError> {
        self.builds.entry(build).or_default();
        Ok(())
    }

    async fn append(&self, build: BuildId, event: Event) -> Result<Envelope, EventStoreError> {
        let mut log = self.builds.entry(build).or_default();
        if log.finalized {
            return Err(EventStoreError::Finalized(build));
        }

        let envelope = event.sequenced(log.events.len() as Sequence);
        log.events.push(envelope.clone());

        Ok(envelope)
    }

    async fn read_from(
        &self,
        build: BuildId,
        from: Sequence,
    ) -> Result<Box<dyn Cursor>, EventStoreError> {
        if !self.builds.contains_key(&build) {
            return Err(EventStoreError::NotFound(build));
        }

        Ok(Box::new(InMemoryCursor {
            builds: Arc::clone(&self.builds),
            build,
            next: from,
            closed: false,
        }))
    }

    async fn finalize(&self, build: BuildId) -> Result<(), EventStoreError> {
        let mut log = self
            .builds
            .get_mut(&build)
            .ok_or(EventStoreError::NotFound(build))?;
        log.finalized = true;
        Ok(())
    }

    async fn is_finalized(&self, build: BuildId) -> Result<bool, EventStoreError> {
        self.builds
            .get(&build)
            .map(|log| log.finalized)
            .ok_or(EventStoreError::NotFound(build))
    }

    async fn delete(&self, build: BuildId) -> Result<(), EventStoreError> {
        if let Some((_, log)) = self.builds.remove(&build) {
            debug!(build_id = %build, events = log.events.len(), "Deleted build events");
        }
        Ok(())
    }
}

/// Cursor over an [`InMemoryEventStore`]; sees appends made after it opened.
struct InMemoryCursor {
    builds: Arc<DashMap<BuildId, BuildLog>>,
    build: BuildId,
    next: Sequence,
    closed: bool,
}

#[async_trait]
impl Cursor for InMemoryCursor {
    async fn next(&mut self) -> Result<Option<Envelope>, EventStoreError> {
        if self.closed {
            return Err(EventStoreError::CursorClosed);
        }

        let log = self
            .builds
            .get(&self.build)
            .ok_or(EventStoreError::NotFound(self.build))?;

        let Some(envelope) = usize::try_from(self.next)
            .ok()
            .and_then(|idx| log.events.get(idx))
        else {
            return Ok(None);
        };

        self.next += 1;
        Ok(Some(envelope.clone()))
    }

    async fn close(&mut self) -> Result<(), EventStoreError> {
        self.closed = true;
        Ok(())
    }
}
