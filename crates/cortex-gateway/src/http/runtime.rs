//! Runtime status route — GET /v1/runtime/digest
//!
//! Read-only view over the digest runtime state and lock status. The v2
//! response shape never exposes internals on failure — errors surface as
//! `{"error": "<brief>"}`.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::app::AppState;

pub async fn digest_status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    // State reads degrade to the empty default and never fail; the lock
    // status is computed from the file on each call.
    let runtime = state.runtime_state.get_state();
    let lock = state.lock_service.get_lock_status();

    if state.config.digest.runtime_api_v2 {
        (
            StatusCode::OK,
            Json(json!({
                "state": runtime,
                "lock": lock,
            })),
        )
    } else {
        // Legacy flat shape: state fields at the top level.
        (
            StatusCode::OK,
            Json(json!({
                "daily": runtime.daily,
                "weekly": runtime.weekly,
                "archive": runtime.archive,
                "catch_up": runtime.catch_up,
                "jit": runtime.jit,
                "lock": lock,
            })),
        )
    }
}

pub async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

/// GET /v1/packages — executor inventory with allowlist (dict shape).
pub async fn packages_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.executor.list_packages().await {
        Ok(packages) => (StatusCode::OK, Json(json!(packages))),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": e.code() })),
        ),
    }
}

/// GET /v1/packages/installed — lowercase package names (compat shape).
pub async fn packages_installed_handler(
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match state.executor.installed_packages().await {
        Ok(packages) => (StatusCode::OK, Json(json!({ "packages": packages }))),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": e.code() })),
        ),
    }
}
