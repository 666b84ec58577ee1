#![cfg(unix)]

mod common;

use agent_bridge::wire::{HybridReader, Segment};
use agent_bridge::{build_router, AppState, OutwardChunk, WireFormat};
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::{text_block, FakeAgent, INIT_S1, MESSAGE_START, MESSAGE_STOP, RESULT_S1};

fn hello_agent() -> FakeAgent {
    let block = text_block(0, "hello");
    let mut lines = vec![INIT_S1, MESSAGE_START];
    lines.extend(block.iter().map(String::as_str));
    lines.push(MESSAGE_STOP);
    lines.push(RESULT_S1);
    FakeAgent::printing(&lines)
}

fn stream_request(body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/v1/stream")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes()
        .to_vec()
}

#[tokio::test]
async fn health_reports_ok() {
    let app = build_router(AppState::new(Default::default()));
    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/health")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).expect("json");
    assert_eq!(body, json!({ "ok": true }));
}

#[tokio::test]
async fn hybrid_stream_carries_prose_and_events() {
    let agent = hello_agent();
    let state = AppState::new(agent.config());
    let app = build_router(state.clone());

    let response = app
        .oneshot(stream_request(json!({
            "messages": [{ "role": "user", "content": "say hello" }]
        })))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        WireFormat::Hybrid.content_type()
    );
    assert_eq!(response.headers()["x-stream-id"], "stream-1");

    let bytes = body_bytes(response).await;
    let mut reader = HybridReader::new();
    let mut segments = reader.push(&bytes);
    segments.extend(reader.finish());

    assert_eq!(segments[0], Segment::Prose("hello".to_string()));
    match &segments[1] {
        Segment::Event(OutwardChunk::Done { session_id, usage }) => {
            assert_eq!(session_id.as_deref(), Some("s1"));
            assert_eq!(usage.total_tokens, 15);
        }
        other => panic!("expected done event, got {other:?}"),
    }
    assert_eq!(segments.len(), 2);
    assert!(state.streams.is_empty());
}

#[tokio::test]
async fn ndjson_stream_is_one_object_per_line() {
    let agent = hello_agent();
    let mut config = agent.config();
    config.wire_format = WireFormat::Ndjson;
    let app = build_router(AppState::new(config));

    let response = app
        .oneshot(stream_request(json!({
            "messages": [{ "role": "user", "content": "say hello" }]
        })))
        .await
        .expect("response");
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/x-ndjson");

    let bytes = body_bytes(response).await;
    let lines: Vec<Value> = String::from_utf8(bytes)
        .expect("utf8")
        .lines()
        .map(|line| serde_json::from_str(line).expect("json line"))
        .collect();
    assert_eq!(lines[0], json!({ "type": "text", "text": "hello" }));
    assert_eq!(lines[1]["type"], "done");
    assert_eq!(lines[1]["sessionId"], "s1");
}

#[tokio::test]
async fn rejects_non_json_content_type() {
    let app = build_router(AppState::new(Default::default()));
    let response = app
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/v1/stream")
                .header(header::CONTENT_TYPE, "text/plain")
                .body(Body::from("hi"))
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/problem+json"
    );
}

#[tokio::test]
async fn missing_user_turn_is_a_bad_request() {
    let app = build_router(AppState::new(Default::default()));
    let response = app
        .oneshot(stream_request(json!({ "messages": [] })))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).expect("json");
    insta::assert_json_snapshot!(body, @r###"
    {
      "detail": "invalid request: request has no user turn to send",
      "status": 400,
      "title": "Invalid Request",
      "type": "urn:agent-bridge:error:invalid_request"
    }
    "###);
}

#[tokio::test]
async fn spawn_failure_is_a_bad_gateway() {
    let mut config = agent_bridge::BridgeConfig::default();
    config.claude_bin = "/definitely/not/a/real/agent".into();
    let app = build_router(AppState::new(config));

    let response = app
        .oneshot(stream_request(json!({
            "messages": [{ "role": "user", "content": "hi" }]
        })))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).expect("json");
    assert_eq!(body["type"], "urn:agent-bridge:error:spawn_failed");
}

#[tokio::test]
async fn delete_cancels_an_active_stream() {
    let agent = FakeAgent::new(&format!("echo '{INIT_S1}'\nexec sleep 30"));
    let state = AppState::new(agent.config());
    let app = build_router(state.clone());

    let response = app
        .clone()
        .oneshot(stream_request(json!({
            "messages": [{ "role": "user", "content": "long" }]
        })))
        .await
        .expect("response");
    let id = response.headers()["x-stream-id"]
        .to_str()
        .expect("id")
        .to_string();
    assert_eq!(state.streams.len(), 1);

    let deleted = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::DELETE)
                .uri(format!("/v1/stream/{id}"))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

    let body = tokio::time::timeout(std::time::Duration::from_secs(5), body_bytes(response))
        .await
        .expect("body ends after cancel");
    assert!(body.is_empty());
    assert!(state.streams.is_empty());

    let again = app
        .oneshot(
            Request::builder()
                .method(Method::DELETE)
                .uri(format!("/v1/stream/{id}"))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(again.status(), StatusCode::NOT_FOUND);
}
