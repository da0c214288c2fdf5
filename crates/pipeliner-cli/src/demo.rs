//! Demo producer for trying the event endpoint without a build engine.
//!
//! ```bash
//! pipeliner serve --demo
//! curl -N localhost:8080/api/v1/builds/1/events
//! ```

use anyhow::Result;
use pipeliner_events::{
    BuildEvent, BuildId, BuildStatus, EventBus, LogSource, Origin, ResourcePlan,
};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Build id the demo publishes to.
pub const DEMO_BUILD: BuildId = BuildId(1);

fn credentials(key: &str, value: &str) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(key.to_string(), Value::from(value));
    map
}

/// The events of a small build: fetch a repo, run a task, succeed.
pub fn demo_events() -> Vec<BuildEvent> {
    let task = Origin::step("unit-tests");
    let repo = ResourcePlan {
        name: "repo".to_string(),
        resource: "repo".to_string(),
        resource_type: "git".to_string(),
        source: credentials("private_key", "-----BEGIN KEY-----"),
        params: credentials("depth", "1"),
        version: None,
    };

    let mut events = vec![
        BuildEvent::Status {
            status: BuildStatus::Started,
        },
        BuildEvent::Input { plan: repo.clone() },
        BuildEvent::FinishGet {
            origin: Origin::step("get-repo"),
            plan: repo,
            exit_status: 0,
        },
        BuildEvent::Initialize {
            image: "alpine:3".to_string(),
            params: credentials("API_TOKEN", "hunter2"),
            run: json!({ "path": "sh", "args": ["-c", "make test"] }),
        },
        BuildEvent::StartTask {
            origin: task.clone(),
        },
    ];

    events.extend((1..=5).map(|i| BuildEvent::Log {
        origin: task.clone().with_source(LogSource::Stdout),
        payload: format!("test {i}/5 ... ok\n"),
    }));

    events.push(BuildEvent::FinishTask {
        origin: task,
        exit_status: 0,
    });
    events.push(BuildEvent::Status {
        status: BuildStatus::Succeeded,
    });
    events
}

/// Publishes [`demo_events`] one per `interval`, then finishes the build.
pub async fn run_demo(bus: Arc<EventBus>, interval: Duration) -> Result<()> {
    bus.start(DEMO_BUILD).await?;
    info!(build_id = %DEMO_BUILD, "Demo build started");

    for event in demo_events() {
        tokio::time::sleep(interval).await;
        bus.publish(DEMO_BUILD, event).await?;
    }

    bus.finish(DEMO_BUILD).await?;
    info!(build_id = %DEMO_BUILD, "Demo build finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeliner_api::BuildLookup;
    use pipeliner_events::InMemoryEventStore;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_demo_events_shape() {
        let events = demo_events();
        assert_eq!(events.first().map(BuildEvent::event_type), Some("status"));
        assert_eq!(events.last().map(BuildEvent::event_type), Some("status"));
        assert!(events.iter().any(|e| e.event_type() == "initialize"));
    }

    #[tokio::test]
    async fn test_run_demo_finishes_build() {
        let store = Arc::new(InMemoryEventStore::new());
        let bus = Arc::new(EventBus::new(store.clone()));

        run_demo(bus.clone(), Duration::ZERO).await.unwrap();

        assert_eq!(store.len(DEMO_BUILD), Some(demo_events().len()));
        let info = bus.find_build(DEMO_BUILD).await.unwrap();
        assert_eq!(info.status, BuildStatus::Succeeded);
    }
}
