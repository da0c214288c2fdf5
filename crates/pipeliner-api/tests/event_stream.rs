use axum::Router;
use axum::body::{Body, BodyDataStream};
use axum::http::{Request, StatusCode, header};
use futures::StreamExt;
use pipeliner_api::{ApiConfig, InMemoryBuilds, RestServer, SseFrame, SseReader};
use pipeliner_events::{BuildId, BuildStatus, Event, EventBus, InMemoryEventStore};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const BUILD: BuildId = BuildId(128);

struct Harness {
    bus: Arc<EventBus>,
    builds: Arc<InMemoryBuilds>,
    app: Router,
}

fn harness(config: ApiConfig) -> Harness {
    let bus = Arc::new(EventBus::new(Arc::new(InMemoryEventStore::new())));
    let builds = Arc::new(InMemoryBuilds::new());
    let app = RestServer::new(config, bus.clone(), builds.clone())
        .app()
        .unwrap();
    Harness { bus, builds, app }
}

fn fake(value: &str) -> Event {
    Event::new("fake", "42.0", json!({ "value": value }))
}

fn request(build: BuildId, headers: &[(&str, &str)]) -> Request<Body> {
    let mut builder = Request::builder().uri(format!("/api/v1/builds/{build}/events"));
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::empty()).unwrap()
}

async fn get(harness: &Harness, build: BuildId, headers: &[(&str, &str)]) -> axum::response::Response {
    harness.app.clone().oneshot(request(build, headers)).await.unwrap()
}

async fn read_to_end(response: axum::response::Response) -> String {
    let bytes = tokio::time::timeout(
        Duration::from_secs(5),
        axum::body::to_bytes(response.into_body(), usize::MAX),
    )
    .await
    .expect("stream did not end")
    .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Reads until at least one frame is complete.
async fn next_frames(body: &mut BodyDataStream, reader: &mut SseReader) -> Vec<SseFrame> {
    loop {
        let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .expect("no frame arrived")
            .expect("stream ended")
            .unwrap();
        let frames = reader.push(&chunk);
        if !frames.is_empty() {
            return frames;
        }
    }
}

fn frame(sequence: u64, value: &str) -> String {
    format!(
        "id: {sequence}\nevent: event\ndata: {{\"data\":{{\"value\":\"{value}\"}},\"event\":\"fake\",\"version\":\"42.0\"}}\n\n"
    )
}

const END: &str = "event: end\ndata: \n\n";

#[tokio::test]
async fn test_live_stream_is_byte_exact() {
    let harness = harness(ApiConfig::default());
    harness.builds.set_status(BUILD, BuildStatus::Started);
    harness.bus.start(BUILD).await.unwrap();

    let response = get(&harness, BUILD, &[]).await;
    assert_eq!(response.status(), StatusCode::OK);

    for value in ["e1", "e2", "e3"] {
        harness.bus.publish(BUILD, fake(value)).await.unwrap();
    }
    harness.bus.finish(BUILD).await.unwrap();
    harness.builds.set_status(BUILD, BuildStatus::Succeeded);

    let expected = [frame(0, "e1"), frame(1, "e2"), frame(2, "e3"), END.to_string()].concat();
    assert_eq!(read_to_end(response).await, expected);
}

#[tokio::test]
async fn test_replay_resumes_after_last_event_id() {
    let harness = harness(ApiConfig::default());
    for value in ["e1", "e2", "e3"] {
        harness.bus.publish(BUILD, fake(value)).await.unwrap();
    }
    harness.bus.finish(BUILD).await.unwrap();
    harness.builds.set_status(BUILD, BuildStatus::Succeeded);

    let response = get(&harness, BUILD, &[("last-event-id", "1")]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_to_end(response).await, [frame(2, "e3"), END.to_string()].concat());
}

#[tokio::test]
async fn test_live_resumes_after_last_event_id() {
    let harness = harness(ApiConfig::default());
    harness.builds.set_status(BUILD, BuildStatus::Started);
    for value in ["e1", "e2", "e3"] {
        harness.bus.publish(BUILD, fake(value)).await.unwrap();
    }

    let response = get(&harness, BUILD, &[("last-event-id", "1")]).await;
    harness.bus.publish(BUILD, fake("e4")).await.unwrap();
    harness.bus.finish(BUILD).await.unwrap();

    assert_eq!(
        read_to_end(response).await,
        [frame(2, "e3"), frame(3, "e4"), END.to_string()].concat()
    );
}

#[tokio::test]
async fn test_stream_headers() {
    let harness = harness(ApiConfig::default());
    harness.builds.set_status(BUILD, BuildStatus::Succeeded);

    let response = get(&harness, BUILD, &[]).await;
    let headers = response.headers();
    assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream; charset=utf-8");
    assert_eq!(headers[header::CACHE_CONTROL], "no-cache, no-store, must-revalidate");
    assert_eq!(headers["x-pipeliner-stream-version"], "2.0");

    // Finished without events: only the terminal frame.
    assert_eq!(read_to_end(response).await, END);
}

#[tokio::test]
async fn test_frames_are_flushed_as_produced() {
    let harness = harness(ApiConfig::default());
    harness.builds.set_status(BUILD, BuildStatus::Started);

    let response = get(&harness, BUILD, &[]).await;
    let mut body = response.into_body().into_data_stream();
    let mut reader = SseReader::new();

    harness.bus.publish(BUILD, fake("e1")).await.unwrap();
    let frames = next_frames(&mut body, &mut reader).await;
    assert_eq!(frames[0].sequence(), Some(0));

    harness.bus.publish(BUILD, fake("e2")).await.unwrap();
    let frames = next_frames(&mut body, &mut reader).await;
    assert_eq!(frames[0].sequence(), Some(1));
    assert_eq!(
        frames[0].envelope().unwrap().map(|e| e.payload),
        Some(json!({"value": "e2"}))
    );
}

#[tokio::test]
async fn test_client_disconnect_releases_subscription() {
    let harness = harness(ApiConfig::default());
    harness.builds.set_status(BUILD, BuildStatus::Started);

    let response = get(&harness, BUILD, &[]).await;
    assert_eq!(harness.bus.tracker().refcount(BUILD), 1);

    drop(response);
    assert_eq!(harness.bus.tracker().refcount(BUILD), 0);

    // The build keeps going without observers.
    harness.bus.publish(BUILD, fake("e1")).await.unwrap();
}

#[tokio::test]
async fn test_drain_ends_live_streams_without_end_frame() {
    let harness = harness(ApiConfig::default());
    harness.builds.set_status(BUILD, BuildStatus::Started);
    harness.bus.publish(BUILD, fake("e1")).await.unwrap();

    let response = get(&harness, BUILD, &[]).await;
    let mut body = response.into_body().into_data_stream();
    let mut reader = SseReader::new();
    assert_eq!(next_frames(&mut body, &mut reader).await[0].sequence(), Some(0));

    harness.bus.drain().await;

    let mut rest = Vec::new();
    while let Some(chunk) = tokio::time::timeout(Duration::from_secs(5), body.next())
        .await
        .expect("stream not closed by drain")
    {
        rest.extend(reader.push(&chunk.unwrap()));
    }
    assert!(rest.iter().all(|f| !f.is_end()));

    let response = get(&harness, BUILD, &[]).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_malformed_last_event_id_rejected() {
    let harness = harness(ApiConfig::default());
    harness.builds.set_status(BUILD, BuildStatus::Started);

    let response = get(&harness, BUILD, &[("last-event-id", "nope")]).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(harness.bus.tracker().refcount(BUILD), 0);
}

#[tokio::test]
async fn test_unknown_build_not_found() {
    let harness = harness(ApiConfig::default());
    let response = get(&harness, BuildId(404), &[]).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

async fn initialize_payload(harness: &Harness, headers: &[(&str, &str)]) -> serde_json::Value {
    let response = get(harness, BUILD, headers).await;
    let body = read_to_end(response).await;
    let frames = SseReader::new().push(body.as_bytes());
    frames[0].envelope().unwrap().unwrap().payload
}

#[tokio::test]
async fn test_unauthorized_viewers_see_censored_events() {
    let mut config = ApiConfig::default();
    config.auth.token = Some("s3cr3t".to_string());
    let harness = harness(config);
    harness.builds.set_status(BUILD, BuildStatus::Succeeded);

    harness
        .bus
        .publish(
            BUILD,
            Event::new(
                "initialize",
                "1.0",
                json!({"config": {"image": "alpine", "params": {"TOKEN": "hunter2"}}}),
            ),
        )
        .await
        .unwrap();
    harness.bus.finish(BUILD).await.unwrap();

    assert_eq!(
        initialize_payload(&harness, &[]).await,
        json!({"config": {"image": "alpine"}})
    );
    assert_eq!(
        initialize_payload(&harness, &[("authorization", "Bearer s3cr3t")]).await,
        json!({"config": {"image": "alpine", "params": {"TOKEN": "hunter2"}}})
    );
}

#[tokio::test]
async fn test_live_stream_censored_for_anonymous_viewer() {
    let mut config = ApiConfig::default();
    config.auth.token = Some("s3cr3t".to_string());
    let harness = harness(config);
    harness.builds.set_status(BUILD, BuildStatus::Started);

    let response = get(&harness, BUILD, &[]).await;
    harness
        .bus
        .publish(
            BUILD,
            Event::new(
                "finish-get",
                "5.1",
                json!({"plan": {"name": "repo", "source": {"private_key": "k"}, "params": {}}}),
            ),
        )
        .await
        .unwrap();
    harness.bus.finish(BUILD).await.unwrap();

    let body = read_to_end(response).await;
    let frames = SseReader::new().push(body.as_bytes());
    assert_eq!(
        frames[0].envelope().unwrap().unwrap().payload,
        json!({"plan": {"name": "repo"}})
    );
    assert!(frames[1].is_end());
}

#[tokio::test]
async fn test_replays_are_byte_identical() {
    let harness = harness(ApiConfig::default());
    for value in ["e1", "e2", "e3", "e4"] {
        harness.bus.publish(BUILD, fake(value)).await.unwrap();
    }
    harness.bus.finish(BUILD).await.unwrap();
    harness.builds.set_status(BUILD, BuildStatus::Failed);

    let first = read_to_end(get(&harness, BUILD, &[]).await).await;
    let second = read_to_end(get(&harness, BUILD, &[]).await).await;

    assert_eq!(first, second);
    assert!(first.ends_with(END));
}
