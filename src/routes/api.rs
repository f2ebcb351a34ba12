use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::api;
use crate::state::AppState;
use std::sync::Arc;

/// Create the HTTP API router
///
/// Health checks and read-only session inspection. Nothing here touches a
/// live call.
pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(api::health_check))
        .route("/health", get(api::health_check))
        .route("/sessions", get(api::list_sessions))
        .route("/sessions/{stream_sid}", get(api::get_session))
        .layer(TraceLayer::new_for_http())
}
