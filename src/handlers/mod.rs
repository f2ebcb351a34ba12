//! HTTP and WebSocket request handlers
//!
//! - `api` - Health check and session inspection
//! - `media` - Exotel media stream WebSocket

pub mod api;
pub mod media;

pub use media::media_handler;
