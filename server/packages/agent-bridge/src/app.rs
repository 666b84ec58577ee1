use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use agent_bridge_error::{BridgeProblem, ProblemDetails};
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Serialize;

use crate::config::BridgeConfig;
use crate::launch::StreamRequest;
use crate::process::{BridgeSession, CancelHandle};

pub const STREAM_ID_HEADER: &str = "x-stream-id";

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

/// Cancel handles of the streams currently being served, keyed by stream id.
#[derive(Debug, Clone, Default)]
pub struct StreamRegistry {
    streams: Arc<Mutex<HashMap<String, CancelHandle>>>,
    next_id: Arc<AtomicU64>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, handle: CancelHandle) -> String {
        let id = format!("stream-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.lock().insert(id.clone(), handle);
        id
    }

    fn remove(&self, id: &str) {
        self.lock().remove(id);
    }

    /// Cancels one stream. Returns false when `id` is not active.
    pub fn cancel(&self, id: &str) -> bool {
        let handle = self.lock().remove(id);
        match handle {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let handles: Vec<CancelHandle> = self.lock().drain().map(|(_, handle)| handle).collect();
        for handle in &handles {
            handle.cancel();
        }
        handles.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancelHandle>> {
        // A panic while holding the lock cannot leave the map inconsistent.
        self.streams
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Drops the registry entry when the response body goes away.
struct RegistryGuard {
    registry: StreamRegistry,
    id: String,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
        tracing::debug!(stream_id = %self.id, "stream released");
    }
}

#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<BridgeConfig>,
    pub streams: StreamRegistry,
}

impl AppState {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config: Arc::new(config),
            streams: StreamRegistry::new(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/health", get(get_health))
        .route("/v1/stream", post(post_stream))
        .route("/v1/stream/:id", delete(delete_stream))
        .with_state(state)
}

async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

async fn post_stream(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if !is_json_content_type(&headers) {
        return problem(&BridgeProblem::UnsupportedMediaType {
            message: "content-type must be application/json".to_string(),
        });
    }

    let request: StreamRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return problem(&BridgeProblem::InvalidRequest {
                message: format!("request body is not a valid stream request: {err}"),
            });
        }
    };

    let stream = match BridgeSession::start(state.config.clone(), &request) {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!(error = %err, "failed to start agent stream");
            return problem(&err.to_problem());
        }
    };

    let content_type = stream.wire_format().content_type();
    let id = state.streams.insert(stream.cancel_handle());
    tracing::info!(stream_id = %id, "agent stream started");

    let guard = RegistryGuard {
        registry: state.streams.clone(),
        id: id.clone(),
    };
    let body = stream.into_bytes().map(move |item| {
        let guard = &guard;
        if let Err(err) = &item {
            tracing::warn!(stream_id = %guard.id, error = %err, "aborting response body");
        }
        item
    });

    let mut response = Response::new(Body::from_stream(body));
    let response_headers = response.headers_mut();
    response_headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    if let Ok(value) = HeaderValue::from_str(&id) {
        response_headers.insert(STREAM_ID_HEADER, value);
    }
    response
}

async fn delete_stream(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if state.streams.cancel(&id) {
        tracing::info!(stream_id = %id, "agent stream cancelled by caller");
        StatusCode::NO_CONTENT.into_response()
    } else {
        problem(&BridgeProblem::StreamNotFound { stream_id: id })
    }
}

fn is_json_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("application/json"))
        .unwrap_or(false)
}

fn problem(problem: &BridgeProblem) -> Response {
    let details: ProblemDetails = problem.to_problem_details();
    let status = StatusCode::from_u16(details.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, "application/problem+json")],
        Json(details),
    )
        .into_response()
}
