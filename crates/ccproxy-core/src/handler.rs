//! Client-facing HTTP surface: the Anthropic Messages endpoint, the model
//! list, and liveness.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use ccproxy_protocol::claude::stream::StreamEvent;
use ccproxy_protocol::claude::{CreateMessageBody, ErrorEnvelope};

use crate::config::ProxyConfig;
use crate::dispatch::DispatchEngine;
use crate::error::DispatchError;
use crate::models;

/// Canonical events buffered between the dispatch task and the client body.
const EVENT_CHANNEL_CAPACITY: usize = 64;

pub struct AppState {
    pub config: ProxyConfig,
    pub engine: DispatchEngine,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/messages", post(create_message))
        .route("/v1/models", get(list_models))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> Response {
    json_response(StatusCode::OK, json!({"status": "ok"}))
}

async fn list_models(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(response) = authenticate(&state.config, &headers) {
        return response;
    }
    let data: Vec<_> = models::MODELS
        .iter()
        .map(|spec| {
            json!({
                "type": "model",
                "id": spec.id,
                "display_name": spec.display_name,
                "context_window": spec.context_window,
                "max_output_tokens": spec.max_output_tokens,
            })
        })
        .collect();
    json_response(
        StatusCode::OK,
        json!({
            "data": data,
            "has_more": false,
        }),
    )
}

async fn create_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(response) = authenticate(&state.config, &headers) {
        return response;
    }
    let request: CreateMessageBody = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return error_body(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                &format!("malformed request body: {err}"),
                None,
            );
        }
    };
    info!(
        event = "client_request",
        model = %request.model,
        stream = request.wants_stream(),
        messages = request.messages.len()
    );

    if request.wants_stream() {
        stream_message(state, request).await
    } else {
        match state.engine.send(&request).await {
            Ok(message) => json_response(StatusCode::OK, json!(message)),
            Err(err) => error_response(&err),
        }
    }
}

async fn stream_message(state: Arc<AppState>, request: CreateMessageBody) -> Response {
    let (tx, mut rx) = mpsc::channel::<StreamEvent>(EVENT_CHANNEL_CAPACITY);
    let handle = tokio::spawn(async move {
        let result = state.engine.send_stream(&request, &tx).await;
        if let Err(err) = &result {
            warn!(event = "stream_failed", error = %err);
        }
        result
    });

    // Hold the HTTP status until the first event; failures that precede any
    // byte surface as a plain error response instead of a broken stream.
    let Some(first) = rx.recv().await else {
        let result = match handle.await {
            Ok(result) => result,
            Err(join_err) => Err(DispatchError::NetworkError(join_err.to_string())),
        };
        return match result {
            Ok(()) => error_response(&DispatchError::EmptyResponse),
            Err(err) => error_response(&err),
        };
    };

    let events = futures_util::stream::iter(std::iter::once(first)).chain(ReceiverStream::new(rx));
    let frames = events.filter_map(|event| async move {
        event.to_sse_bytes().map(Ok::<Bytes, Infallible>)
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(frames))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Fixed shared-token check; accepts `x-api-key` or a bearer Authorization.
fn authenticate(config: &ProxyConfig, headers: &HeaderMap) -> Result<(), Response> {
    let presented = extract_api_key(headers).ok_or_else(|| {
        error_body(
            StatusCode::UNAUTHORIZED,
            "authentication_error",
            "missing api key",
            None,
        )
    })?;
    if presented != config.auth_token {
        return Err(error_body(
            StatusCode::FORBIDDEN,
            "permission_error",
            "invalid api key",
            None,
        ));
    }
    Ok(())
}

fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(value.trim().to_string());
    }
    let auth = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    auth.strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))
        .map(|token| token.trim().to_string())
}

fn error_response(err: &DispatchError) -> Response {
    error_body(
        err.client_status(),
        err.kind(),
        &err.to_string(),
        err.retry_after_secs(),
    )
}

fn error_body(
    status: StatusCode,
    kind: &str,
    message: &str,
    retry_after_secs: Option<u64>,
) -> Response {
    let envelope = ErrorEnvelope::new(kind, message);
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(secs) = retry_after_secs {
        builder = builder.header(header::RETRY_AFTER, secs.to_string());
    }
    builder
        .body(Body::from(
            serde_json::to_vec(&envelope).unwrap_or_default(),
        ))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(value.to_string()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
