//! Typed build events.
//!
//! Producers describe what happened with a [`BuildEvent`] and convert it into
//! an [`Event`] with [`BuildEvent::into_event`]; the payload shape and the
//! protocol version of each type are owned here.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::envelope::Event;

/// Lifecycle status of a build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Started,
    Succeeded,
    Failed,
    Errored,
    Aborted,
}

impl BuildStatus {
    /// True while the build may still produce events.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Pending | Self::Started)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Errored => "errored",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which stream of a step a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
}

/// Identifies the step an event belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<LogSource>,
}

impl Origin {
    pub fn step(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: LogSource) -> Self {
        self.source = Some(source);
        self
    }
}

/// Resource plan as seen by `input`/`output` and `finish-get`/`finish-put`.
///
/// `source` and `params` may carry credentials.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourcePlan {
    pub name: String,
    pub resource: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub source: Map<String, Value>,
    pub params: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<Map<String, Value>>,
}

/// Build events produced by the execution engine
#[derive(Debug, Clone, PartialEq)]
pub enum BuildEvent {
    Log {
        origin: Origin,
        payload: String,
    },
    Status {
        status: BuildStatus,
    },
    /// Build configuration; `params` may carry credentials.
    Initialize {
        image: String,
        params: Map<String, Value>,
        run: Value,
    },
    StartTask {
        origin: Origin,
    },
    FinishTask {
        origin: Origin,
        exit_status: i32,
    },
    Input {
        plan: ResourcePlan,
    },
    Output {
        plan: ResourcePlan,
    },
    FinishGet {
        origin: Origin,
        plan: ResourcePlan,
        exit_status: i32,
    },
    FinishPut {
        origin: Origin,
        plan: ResourcePlan,
        exit_status: i32,
    },
    Error {
        origin: Option<Origin>,
        message: String,
    },
}

impl BuildEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Log { .. } => "log",
            Self::Status { .. } => "status",
            Self::Initialize { .. } => "initialize",
            Self::StartTask { .. } => "start-task",
            Self::FinishTask { .. } => "finish-task",
            Self::Input { .. } => "input",
            Self::Output { .. } => "output",
            Self::FinishGet { .. } => "finish-get",
            Self::FinishPut { .. } => "finish-put",
            Self::Error { .. } => "error",
        }
    }

    /// Current protocol version emitted for this event type.
    pub fn version(&self) -> &'static str {
        match self {
            Self::Log { .. } => "5.1",
            Self::Status { .. } => "1.0",
            Self::Initialize { .. } => "1.0",
            Self::StartTask { .. } | Self::FinishTask { .. } => "4.0",
            Self::Input { .. } | Self::Output { .. } => "2.0",
            Self::FinishGet { .. } | Self::FinishPut { .. } => "5.1",
            Self::Error { .. } => "4.1",
        }
    }

    /// Builds the wire payload, stamping the current time where the event
    /// carries one.
    pub fn into_event(self) -> Event {
        let event_type = self.event_type();
        let version = self.version();
        let time = Utc::now().timestamp();

        let payload = match self {
            Self::Log { origin, payload } => json!({
                "origin": origin,
                "payload": payload,
                "time": time,
            }),
            Self::Status { status } => json!({ "status": status, "time": time }),
            Self::Initialize { image, params, run } => json!({
                "config": { "image": image, "params": params, "run": run },
            }),
            Self::StartTask { origin } => json!({ "origin": origin, "time": time }),
            Self::FinishTask {
                origin,
                exit_status,
            } => json!({ "origin": origin, "exit_status": exit_status, "time": time }),
            Self::Input { plan } | Self::Output { plan } => json!({ "plan": plan }),
            Self::FinishGet {
                origin,
                plan,
                exit_status,
            }
            | Self::FinishPut {
                origin,
                plan,
                exit_status,
            } => json!({
                "origin": origin,
                "plan": plan,
                "exit_status": exit_status,
                "time": time,
            }),
            Self::Error { origin, message } => json!({
                "origin": origin,
                "message": message,
                "time": time,
            }),
        };

        Event::new(event_type, version, payload)
    }
}

impl From<BuildEvent> for Event {
    fn from(event: BuildEvent) -> Self {
        event.into_event()
    }
}
