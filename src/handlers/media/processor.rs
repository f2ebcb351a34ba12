//! Dispatch of parsed provider events onto a [`Session`].
//!
//! Nothing here touches the socket. The caller executes the returned
//! actions, which keeps the event handling testable without a connection.

use tracing::{debug, info, warn};

use crate::core::session::{Session, SessionAction};
use crate::errors::BridgeError;

use super::messages::IncomingEvent;

/// Result of handling one provider event.
#[derive(Debug, Default)]
pub struct EventOutcome {
    pub actions: Vec<SessionAction>,
    /// The provider ended the stream
    pub stop: bool,
}

impl EventOutcome {
    fn actions(actions: Vec<SessionAction>) -> Self {
        Self {
            actions,
            stop: false,
        }
    }
}

/// Apply one provider event to the session.
///
/// Problems with a single event are logged and swallowed: a bad frame never
/// ends the call.
pub fn process_event(event: IncomingEvent, session: &mut Session) -> EventOutcome {
    match event {
        IncomingEvent::Connected { protocol, version } => {
            debug!(?protocol, ?version, "Provider connected");
            EventOutcome::default()
        }

        IncomingEvent::Start { stream_sid, start } => {
            let format = match start
                .media_format
                .as_ref()
                .map(|media_format| media_format.audio_format(session.format()))
                .transpose()
            {
                Ok(format) => format,
                Err(e) => {
                    warn!(
                        connection_id = %session.connection_id(),
                        error = %e,
                        default_encoding = %session.format().encoding,
                        default_sample_rate = session.format().sample_rate,
                        "Unsupported media format, using default"
                    );
                    None
                }
            };

            if let Some(params) = &start.custom_parameters {
                debug!(custom_parameters = %params, "Start parameters");
            }

            let metadata = start.metadata(stream_sid, session.connection_id());
            match session.start(metadata, format) {
                Ok(actions) => EventOutcome::actions(actions),
                Err(e) => {
                    warn!(connection_id = %session.connection_id(), error = %e, "Ignoring start event");
                    EventOutcome::default()
                }
            }
        }

        IncomingEvent::Media {
            sequence_number,
            media,
        } => match session.on_media(&media.payload) {
            Ok(actions) => EventOutcome::actions(actions),
            Err(e) => {
                warn!(
                    stream_sid = %session.stream_sid(),
                    sequence_number,
                    chunk = media.chunk,
                    error = %e,
                    "Dropping media frame"
                );
                EventOutcome::default()
            }
        },

        IncomingEvent::Dtmf { dtmf } => {
            info!(
                stream_sid = %session.stream_sid(),
                digit = %dtmf.digit,
                duration = dtmf.duration,
                "DTMF received"
            );
            EventOutcome::default()
        }

        IncomingEvent::Mark { mark } => EventOutcome::actions(session.on_mark(&mark.name)),

        IncomingEvent::Clear { .. } => EventOutcome::actions(session.on_clear()),

        IncomingEvent::Stop { stop } => {
            let reason = stop.and_then(|s| s.reason);
            info!(stream_sid = %session.stream_sid(), ?reason, "Stream stopped by provider");
            EventOutcome {
                actions: Vec::new(),
                stop: true,
            }
        }

        IncomingEvent::Unknown => {
            let e = BridgeError::ProtocolError("unrecognized event".to_string());
            debug!(stream_sid = %session.stream_sid(), error = %e, "Ignoring event");
            EventOutcome::default()
        }
    }
}
