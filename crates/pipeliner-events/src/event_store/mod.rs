//! Event store module.
//!
//! The store is the durable, append-only record of every build's envelopes.
//! Live delivery is layered on top of it; anything a subscriber missed can
//! always be read back from here.

pub mod in_memory;

use async_trait::async_trait;

use crate::types::{BuildId, Envelope, Event, Sequence};

pub use in_memory::InMemoryEventStore;

/// Event store trait
///
/// Once `append` returns, the envelope is visible to every later
/// `read_from` covering its sequence, with no gap relative to earlier appends.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Prepares storage for a build. Idempotent.
    async fn initialize(&self, build: BuildId) -> Result<(), EventStoreError>;

    /// Appends an event and returns it with its assigned sequence number.
    async fn append(&self, build: BuildId, event: Event) -> Result<Envelope, EventStoreError>;

    /// Opens a cursor over the build's envelopes starting at `from`.
    async fn read_from(
        &self,
        build: BuildId,
        from: Sequence,
    ) -> Result<Box<dyn Cursor>, EventStoreError>;

    /// Marks the build as having produced its last event.
    async fn finalize(&self, build: BuildId) -> Result<(), EventStoreError>;

    async fn is_finalized(&self, build: BuildId) -> Result<bool, EventStoreError>;

    /// Removes every envelope of the build. Only garbage collection calls this.
    async fn delete(&self, build: BuildId) -> Result<(), EventStoreError>;
}

/// Stateful reader over one build's envelopes.
///
/// `next` yields envelopes in sequence order and returns `Ok(None)` once it
/// has caught up with the store; it never waits for further appends.
#[async_trait]
pub trait Cursor: Send {
    async fn next(&mut self) -> Result<Option<Envelope>, EventStoreError>;

    async fn close(&mut self) -> Result<(), EventStoreError>;
}

/// Event store errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventStoreError {
    #[error("build not found: {0}")]
    NotFound(BuildId),

    #[error("build {0} is finalized")]
    Finalized(BuildId),

    #[error("read from closed cursor")]
    CursorClosed,

    #[error("storage error: {0}")]
    StorageError(String),
}
