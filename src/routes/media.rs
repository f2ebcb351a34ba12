//! Media stream WebSocket route configuration

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::media::media_handler;
use crate::state::AppState;
use std::sync::Arc;

/// Create the media stream router
///
/// # Endpoint
///
/// `GET /media` - WebSocket upgrade for one call's audio
///
/// # Protocol
///
/// The provider sends `connected`, `start`, then a stream of `media` events,
/// with `mark`, `clear`, `dtmf` and finally `stop` as the call progresses.
///
/// The bridge answers with `media` events carrying the synthesized reply,
/// a `mark` after each reply and `clear` when queued playback is dropped.
///
/// # Example
///
/// ```json
/// // Provider sends
/// {"event": "start", "stream_sid": "abc", "start": {"call_sid": "c1", "media_format": {"encoding": "base64", "sample_rate": "8000"}}}
/// {"event": "media", "sequence_number": 2, "media": {"chunk": 1, "timestamp": "20", "payload": "..."}}
///
/// // Bridge replies
/// {"event": "media", "stream_sid": "abc", "sequence_number": 1, "media": {"chunk": 1, "timestamp": "0", "payload": "..."}}
/// {"event": "mark", "stream_sid": "abc", "sequence_number": 2, "mark": {"name": "reply-1"}}
/// ```
pub fn create_media_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/media", get(media_handler))
        .layer(TraceLayer::new_for_http())
}
