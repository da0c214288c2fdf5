//! Envelope types for the build event stream.
//!
//! An [`Envelope`] is one sequenced, immutable event belonging to one build.
//! Producers hand the store an unsequenced [`Event`]; the store assigns the
//! sequence number at append time.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-build position of an envelope. Starts at 0 and has no gaps.
pub type Sequence = u64;

/// Build identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildId(pub u64);

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for BuildId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Tag identifying the shape of an event payload (`log`, `status`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self(event_type.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Protocol version string carried in-band with every envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventVersion(String);

impl EventVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parses `major.minor` (a bare `major` is accepted as `major.0`).
    pub fn parse(&self) -> Result<(u32, u32), VersionParseError> {
        let invalid = || VersionParseError(self.0.clone());

        let mut parts = self.0.trim().splitn(2, '.');
        let major = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(invalid)?
            .parse::<u32>()
            .map_err(|_| invalid())?;
        let minor = match parts.next() {
            Some(minor) => minor.parse::<u32>().map_err(|_| invalid())?,
            None => 0,
        };

        Ok((major, minor))
    }
}

impl fmt::Display for EventVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventVersion {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Returned when a version string is not `major[.minor]`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unparseable event version: {0:?}")]
pub struct VersionParseError(pub String);

/// An event as produced by the build, before the store sequences it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub version: EventVersion,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(
        event_type: impl Into<String>,
        version: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type: EventType::new(event_type),
            version: EventVersion::new(version),
            payload,
        }
    }

    /// Attaches the store-assigned sequence number.
    pub fn sequenced(self, sequence: Sequence) -> Envelope {
        Envelope {
            sequence,
            event_type: self.event_type,
            version: self.version,
            payload: self.payload,
        }
    }
}

/// One sequenced build event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sequence: Sequence,
    pub event_type: EventType,
    pub version: EventVersion,
    pub payload: serde_json::Value,
}

impl Envelope {
    /// The JSON body written on the wire for this envelope.
    pub fn message(&self) -> Message<'_> {
        Message {
            data: &self.payload,
            event: &self.event_type,
            version: &self.version,
        }
    }
}

/// Wire form of an envelope: `{"data": ..., "event": ..., "version": ...}`.
///
/// Field order is part of the wire format.
#[derive(Debug, Serialize)]
pub struct Message<'a> {
    pub data: &'a serde_json::Value,
    pub event: &'a EventType,
    pub version: &'a EventVersion,
}

/// Owned counterpart of [`Message`], used when decoding frames.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OwnedMessage {
    pub data: serde_json::Value,
    pub event: EventType,
    pub version: EventVersion,
}

impl OwnedMessage {
    pub fn into_envelope(self, sequence: Sequence) -> Envelope {
        Envelope {
            sequence,
            event_type: self.event,
            version: self.version,
            payload: self.data,
        }
    }
}
