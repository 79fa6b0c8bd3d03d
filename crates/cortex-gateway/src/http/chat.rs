//! Chat endpoint — POST /v1/chat
//!
//! Body is the normalized request shape. `stream: false` returns the full
//! response as JSON; `stream: true` returns NDJSON, one `{type, …}` event
//! per line with exactly one terminal `{type: "done", done: true}` line.
//!
//! Auth: `Authorization: Bearer <token>` when a gateway token is set.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::StreamExt;
use serde::Serialize;
use tracing::warn;

use cortex_core::types::CoreChatRequest;

use crate::app::AppState;

#[derive(Serialize)]
pub struct ChatError {
    pub error: String,
}

fn error_json(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ChatError {
            error: message.into(),
        }),
    )
        .into_response()
}

/// POST /v1/chat — full pipeline, streaming or not.
pub async fn chat_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<CoreChatRequest>,
) -> Response {
    if !check_auth(&state, &headers) {
        return error_json(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    if request.messages.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "messages cannot be empty");
    }

    if request.stream {
        let stream = state.orchestrator.process_stream(request);
        let ndjson = stream.map(|chunk| {
            let line = serde_json::to_string(&chunk).unwrap_or_else(|e| {
                warn!(error = %e, "chunk serialisation failed");
                r#"{"type":"error","done":false}"#.to_string()
            });
            Ok::<_, std::convert::Infallible>(format!("{line}\n"))
        });
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/x-ndjson")
            .body(Body::from_stream(ndjson))
            .unwrap_or_else(|e| {
                warn!(error = %e, "stream response build failed");
                error_json(StatusCode::INTERNAL_SERVER_ERROR, "stream setup failed")
            })
    } else {
        let response = state.orchestrator.process(request).await;
        Json(response).into_response()
    }
}

pub(crate) fn check_auth(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(expected) = &state.config.gateway.token else {
        return true;
    };
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| token == expected)
        .unwrap_or(false)
}
