//! Connection limit middleware for the media WebSocket
//!
//! Enforces the global WebSocket limit and the per-IP limit before the
//! upgrade handshake completes.
//!
//! # Example
//!
//! ```ignore
//! use axum::Router;
//! use exotel_bridge::middleware::connection_limit_middleware;
//!
//! let app = Router::new()
//!     .route("/media", get(media_handler))
//!     .layer(axum::middleware::from_fn_with_state(
//!         state.clone(),
//!         connection_limit_middleware,
//!     ));
//! ```

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::state::{AppState, ConnectionLimitError};

/// Extension carrying the client IP to the handler so it can release the
/// slot when the socket closes.
#[derive(Clone, Copy, Debug)]
pub struct ClientIp(pub IpAddr);

/// Reject WebSocket upgrades over the configured limits.
///
/// Returns 503 when the global limit is reached and 429 when the caller's IP
/// is over its limit. Requests without an `Upgrade: websocket` header pass
/// through untouched.
pub async fn connection_limit_middleware(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let is_ws_upgrade = request
        .headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    if !is_ws_upgrade {
        return next.run(request).await;
    }

    let client_ip = addr.ip();

    match state.try_acquire_connection(client_ip) {
        Ok(()) => {
            // Released by the media handler when the socket closes
            request.extensions_mut().insert(ClientIp(client_ip));
            let response = next.run(request).await;
            if response.status() != StatusCode::SWITCHING_PROTOCOLS {
                // The upgrade never happened, so no handler will release it
                state.release_connection(client_ip);
            }
            response
        }
        Err(ConnectionLimitError::GlobalLimitReached) => {
            tracing::warn!(ip = %client_ip, "Rejecting connection: global limit reached");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "Server at capacity. Please try again later.",
            )
                .into_response()
        }
        Err(ConnectionLimitError::PerIpLimitReached) => {
            tracing::warn!(ip = %client_ip, "Rejecting connection: per-IP limit reached");
            (
                StatusCode::TOO_MANY_REQUESTS,
                "Too many connections from your IP address.",
            )
                .into_response()
        }
    }
}
