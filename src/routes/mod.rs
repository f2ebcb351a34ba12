pub mod api;
pub mod media;

use axum::{Router, middleware};
use std::sync::Arc;

use crate::middleware::connection_limit_middleware;
use crate::state::AppState;

/// Combine the HTTP API and the media WebSocket into one application.
///
/// The media route sits behind the connection limit middleware, which needs
/// `ConnectInfo<SocketAddr>`; serve the result with
/// `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn create_app_router(state: Arc<AppState>) -> Router {
    let media_routes = media::create_media_router().layer(middleware::from_fn_with_state(
        state.clone(),
        connection_limit_middleware,
    ));

    api::create_api_router()
        .merge(media_routes)
        .with_state(state)
}
