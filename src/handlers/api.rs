use axum::{
    extract::{Path, State},
    response::Json,
};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::core::session::SessionSnapshot;
use crate::errors::AppResult;
use crate::state::AppState;

/// Health check handler
/// Returns a JSON response indicating the server is running
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime": state.uptime_seconds(),
        "active_sessions": state.sessions.len(),
    }))
}

/// List every live media session, oldest first.
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionSnapshot>> {
    Json(state.sessions.list())
}

/// Fetch one session by provider stream id or connection id.
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(stream_sid): Path<String>,
) -> AppResult<Json<SessionSnapshot>> {
    Ok(Json(state.sessions.find(&stream_sid)?))
}
