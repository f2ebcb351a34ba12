//! Exotel media stream WebSocket
//!
//! The provider connects to `/media` and exchanges JSON events with the
//! bridge for the lifetime of one call. See [`messages`] for the wire format.

mod handler;
pub mod messages;
pub mod processor;

pub use handler::media_handler;
pub use messages::{IncomingEvent, MessageRoute, OutgoingEvent, parse_event};
