//! Redaction of credential-bearing event fields.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::ops::RangeInclusive;
use tracing::debug;

use super::{Sink, SinkError};
use crate::types::{Envelope, EventVersion};

/// Protocol major versions the censoring rules are written against.
pub const SUPPORTED_MAJOR_VERSIONS: RangeInclusive<u32> = 1..=5;

type FieldPath = &'static [&'static str];

const CONFIG_PARAMS: &[FieldPath] = &[&["config", "params"]];
const PLAN_SOURCE_PARAMS: &[FieldPath] = &[&["plan", "source"], &["plan", "params"]];
const V1_INPUT_SOURCE_PARAMS: &[FieldPath] = &[&["input", "source"], &["input", "params"]];
const V1_OUTPUT_SOURCE_PARAMS: &[FieldPath] = &[&["output", "source"], &["output", "params"]];

/// Fields to strip from an event of the given type and major version.
fn redacted_fields(event_type: &str, major: u32) -> &'static [FieldPath] {
    match (event_type, major) {
        ("initialize", _) => CONFIG_PARAMS,
        ("input", 1) => V1_INPUT_SOURCE_PARAMS,
        ("output", 1) => V1_OUTPUT_SOURCE_PARAMS,
        ("input" | "output" | "finish-get" | "finish-put", _) => PLAN_SOURCE_PARAMS,
        _ => &[],
    }
}

fn remove_field(payload: &mut Value, path: FieldPath) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };

    let mut current = payload;
    for key in parents {
        match current.get_mut(*key) {
            Some(next) => current = next,
            None => return,
        }
    }

    if let Some(object) = current.as_object_mut() {
        object.remove(*last);
    }
}

/// Redaction state for one stream.
///
/// The first envelope announces the stream's protocol version; later
/// envelopes without a version inherit it.
#[derive(Debug, Clone, Default)]
pub struct Censor {
    protocol: Option<EventVersion>,
}

impl Censor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Version announced by the first envelope, once seen.
    pub fn protocol(&self) -> Option<&EventVersion> {
        self.protocol.as_ref()
    }

    /// Adopts `version` as the protocol unless one is already known.
    ///
    /// Lets a reader that continues a censored stream from another source
    /// keep resolving unversioned envelopes.
    pub fn observe(&mut self, version: &EventVersion) {
        if self.protocol.is_none() && !version.is_empty() {
            self.protocol = Some(version.clone());
        }
    }

    /// Returns a copy of the envelope with sensitive fields removed.
    pub fn apply(&mut self, envelope: &Envelope) -> Result<Envelope, SinkError> {
        let unknown = || SinkError::VersionUnknown {
            event_type: envelope.event_type.to_string(),
            version: envelope.version.to_string(),
        };

        let version = if envelope.version.is_empty() {
            self.protocol.clone().ok_or_else(unknown)?
        } else {
            envelope.version.clone()
        };

        let (major, _) = version.parse().map_err(|_| unknown())?;
        if !SUPPORTED_MAJOR_VERSIONS.contains(&major) {
            return Err(unknown());
        }

        if self.protocol.is_none() {
            debug!(version = %version, "Censored stream announced protocol version");
            self.protocol = Some(version);
        }

        let mut censored = envelope.clone();
        for path in redacted_fields(envelope.event_type.as_str(), major) {
            remove_field(&mut censored.payload, path);
        }

        Ok(censored)
    }
}

/// Sink that censors envelopes before handing them to its inner sink.
pub struct CensoredSink<S> {
    inner: S,
    censor: Mutex<Censor>,
}

impl<S: Sink> CensoredSink<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            censor: Mutex::new(Censor::new()),
        }
    }
}

#[async_trait]
impl<S: Sink> Sink for CensoredSink<S> {
    async fn deliver(&self, envelope: &Envelope) -> Result<(), SinkError> {
        let censored = self.censor.lock().apply(envelope)?;
        self.inner.deliver(&censored).await
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Event;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    fn envelope(event_type: &str, version: &str, payload: Value) -> Envelope {
        Event::new(event_type, version, payload).sequenced(0)
    }

    #[test]
    fn test_initialize_params_stripped() {
        let mut censor = Censor::new();
        let original = envelope(
            "initialize",
            "1.0",
            json!({"config": {"image": "alpine", "params": {"TOKEN": "s3cr3t"}}}),
        );

        let censored = censor.apply(&original).unwrap();
        assert_eq!(censored.payload, json!({"config": {"image": "alpine"}}));
        assert_eq!(censored.sequence, original.sequence);
        assert_eq!(censored.version, original.version);
    }

    #[rstest]
    #[case("input", "2.0")]
    #[case("output", "2.0")]
    #[case("finish-get", "5.1")]
    #[case("finish-put", "5.1")]
    fn test_plan_source_and_params_stripped(#[case] event_type: &str, #[case] version: &str) {
        let mut censor = Censor::new();
        let original = envelope(
            event_type,
            version,
            json!({
                "plan": {"name": "repo", "type": "git", "source": {"private_key": "k"}, "params": {"depth": 1}},
                "exit_status": 0,
            }),
        );

        let censored = censor.apply(&original).unwrap();
        assert_eq!(
            censored.payload,
            json!({"plan": {"name": "repo", "type": "git"}, "exit_status": 0})
        );
    }

    #[test]
    fn test_v1_input_uses_legacy_layout() {
        let mut censor = Censor::new();
        let original = envelope(
            "input",
            "1.0",
            json!({"input": {"name": "repo", "source": {"uri": "x"}, "params": {}}}),
        );

        let censored = censor.apply(&original).unwrap();
        assert_eq!(censored.payload, json!({"input": {"name": "repo"}}));
    }

    #[test]
    fn test_non_sensitive_untouched() {
        let mut censor = Censor::new();
        let original = envelope("log", "5.1", json!({"payload": "hello", "origin": {"id": "a"}}));
        assert_eq!(censor.apply(&original).unwrap(), original);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut censor = Censor::new();
        let original = envelope("log", "42.0", json!({}));

        let result = censor.apply(&original);
        assert_eq!(
            result,
            Err(SinkError::VersionUnknown {
                event_type: "log".to_string(),
                version: "42.0".to_string(),
            })
        );
    }

    #[rstest]
    #[case("")]
    #[case("garbage")]
    fn test_first_message_needs_version(#[case] version: &str) {
        let mut censor = Censor::new();
        let original = envelope("status", version, json!({"status": "started"}));

        assert!(matches!(
            censor.apply(&original),
            Err(SinkError::VersionUnknown { .. })
        ));
        assert!(censor.protocol().is_none());
    }

    #[test]
    fn test_later_messages_inherit_protocol() {
        let mut censor = Censor::new();
        censor.apply(&envelope("status", "1.0", json!({}))).unwrap();

        let unversioned = envelope(
            "initialize",
            "",
            json!({"config": {"params": {"A": "b"}}}),
        );
        let censored = censor.apply(&unversioned).unwrap();

        assert_eq!(censor.protocol().map(EventVersion::as_str), Some("1.0"));
        assert_eq!(censored.payload, json!({"config": {}}));
    }
}
