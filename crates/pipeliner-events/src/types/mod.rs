//! Event types module.

pub mod build;
pub mod envelope;
pub mod legacy;

pub use build::{BuildEvent, BuildStatus, LogSource, Origin, ResourcePlan};
pub use envelope::{
    BuildId, Envelope, Event, EventType, EventVersion, Message, OwnedMessage, Sequence,
    VersionParseError,
};
pub use legacy::{LEGACY_CHUNK_SIZE, chunk_legacy_log};
