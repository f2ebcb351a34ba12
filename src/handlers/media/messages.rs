//! Exotel media stream message types
//!
//! Every frame is a JSON object whose `event` field names its kind. Numeric
//! fields are accepted either as JSON numbers or as numeric strings, since
//! providers differ on this.

use serde::{Deserialize, Deserializer, Serialize};

use crate::core::codec::{AudioEncoding, AudioFormat, SUPPORTED_SAMPLE_RATES};
use crate::core::session::{CallMetadata, OutboundFrame};
use crate::errors::BridgeError;

// =============================================================================
// Incoming Messages (Provider -> Server)
// =============================================================================

/// Incoming WebSocket events from the telephony provider
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum IncomingEvent {
    /// Handshake acknowledgement, informational only
    Connected {
        #[serde(default)]
        protocol: Option<String>,
        #[serde(default)]
        version: Option<String>,
    },

    /// Stream identity and audio format
    Start {
        #[serde(default)]
        stream_sid: Option<String>,
        start: StartPayload,
    },

    /// One frame of caller audio
    Media {
        #[serde(default, deserialize_with = "flexible_u64")]
        sequence_number: Option<u64>,
        media: MediaPayload,
    },

    /// Keypad input
    Dtmf { dtmf: DtmfPayload },

    /// Playback acknowledgement for a mark we sent
    Mark { mark: MarkPayload },

    /// Provider asks us to drop queued playback
    Clear {
        #[serde(default)]
        stream_sid: Option<String>,
    },

    /// End of stream
    Stop {
        #[serde(default)]
        stop: Option<StopPayload>,
    },

    /// Any event this bridge does not know about
    #[serde(other)]
    Unknown,
}

impl IncomingEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Start { .. } => "start",
            Self::Media { .. } => "media",
            Self::Dtmf { .. } => "dtmf",
            Self::Mark { .. } => "mark",
            Self::Clear { .. } => "clear",
            Self::Stop { .. } => "stop",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartPayload {
    /// Some integrations put the stream id here instead of at the top level
    #[serde(default)]
    pub stream_sid: Option<String>,
    #[serde(default)]
    pub call_sid: Option<String>,
    #[serde(default)]
    pub account_sid: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub media_format: Option<MediaFormat>,
    #[serde(default)]
    pub custom_parameters: Option<serde_json::Value>,
}

impl StartPayload {
    /// Call identity, preferring the top-level stream id.
    pub fn metadata(&self, stream_sid: Option<String>, fallback_id: &str) -> CallMetadata {
        CallMetadata {
            stream_sid: stream_sid
                .or_else(|| self.stream_sid.clone())
                .unwrap_or_else(|| fallback_id.to_string()),
            call_sid: self.call_sid.clone(),
            account_sid: self.account_sid.clone(),
            from: self.from.clone(),
            to: self.to.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaFormat {
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default, deserialize_with = "flexible_u64")]
    pub sample_rate: Option<u64>,
    #[serde(default, deserialize_with = "flexible_u64")]
    pub channels: Option<u64>,
}

impl MediaFormat {
    /// Resolve the announced format, filling gaps from `default`.
    pub fn audio_format(&self, default: AudioFormat) -> Result<AudioFormat, BridgeError> {
        let encoding = match self.encoding.as_deref() {
            Some(name) => AudioEncoding::parse(name).ok_or_else(|| {
                BridgeError::UnsupportedAudioFormat(format!("unknown encoding '{name}'"))
            })?,
            None => default.encoding,
        };

        if let Some(channels) = self.channels
            && channels > 1
        {
            return Err(BridgeError::UnsupportedAudioFormat(format!(
                "{channels} channels, only mono is supported"
            )));
        }

        let sample_rate = match self.sample_rate {
            Some(rate) => u32::try_from(rate)
                .ok()
                .filter(|rate| SUPPORTED_SAMPLE_RATES.contains(rate))
                .ok_or_else(|| {
                    BridgeError::UnsupportedAudioFormat(format!(
                        "sample rate {rate} outside {}..={} Hz",
                        SUPPORTED_SAMPLE_RATES.start(),
                        SUPPORTED_SAMPLE_RATES.end()
                    ))
                })?,
            None => default.sample_rate,
        };

        Ok(AudioFormat::new(encoding, sample_rate))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaPayload {
    #[serde(default, deserialize_with = "flexible_u64")]
    pub chunk: Option<u64>,
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
    pub payload: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DtmfPayload {
    pub digit: String,
    #[serde(default, deserialize_with = "flexible_u64")]
    pub duration: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MarkPayload {
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StopPayload {
    #[serde(default)]
    pub call_sid: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u64),
    Text(String),
}

fn flexible_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<NumberOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrString::Number(n)) => Ok(Some(n)),
        Some(NumberOrString::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(NumberOrString::Text(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Parse one text frame.
pub fn parse_event(text: &str) -> Result<IncomingEvent, BridgeError> {
    Ok(serde_json::from_str(text)?)
}

// =============================================================================
// Outgoing Messages (Server -> Provider)
// =============================================================================

/// Outgoing WebSocket events, in the same envelope as incoming ones
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutgoingEvent {
    Connected {
        protocol: String,
        version: String,
    },
    Media {
        stream_sid: String,
        sequence_number: u64,
        media: OutgoingMedia,
    },
    Mark {
        stream_sid: String,
        sequence_number: u64,
        mark: MarkPayload,
    },
    Clear {
        stream_sid: String,
        sequence_number: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutgoingMedia {
    pub chunk: u64,
    /// Milliseconds from the start of this session's outbound audio
    pub timestamp: String,
    /// Base64 encoded channel audio
    pub payload: String,
}

impl OutgoingEvent {
    pub fn connected() -> Self {
        Self::Connected {
            protocol: "Call".to_string(),
            version: "1.0.0".to_string(),
        }
    }

    /// Wrap a numbered session frame for the wire.
    pub fn from_frame(stream_sid: &str, frame: OutboundFrame) -> Self {
        let stream_sid = stream_sid.to_string();
        match frame {
            OutboundFrame::Media {
                sequence_number,
                chunk,
                timestamp_ms,
                payload,
            } => Self::Media {
                stream_sid,
                sequence_number,
                media: OutgoingMedia {
                    chunk,
                    timestamp: timestamp_ms.to_string(),
                    payload: crate::core::codec::encode_frame(&payload),
                },
            },
            OutboundFrame::Mark {
                sequence_number,
                name,
            } => Self::Mark {
                stream_sid,
                sequence_number,
                mark: MarkPayload { name },
            },
            OutboundFrame::Clear { sequence_number } => Self::Clear {
                stream_sid,
                sequence_number,
            },
        }
    }
}

/// Routing for the socket writer task
#[derive(Debug)]
pub enum MessageRoute {
    Outgoing(OutgoingEvent),
    Close,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_start_with_string_numbers() {
        let text = json!({
            "event": "start",
            "sequence_number": "1",
            "stream_sid": "abc",
            "start": {
                "call_sid": "call-9",
                "from": "+15550001",
                "to": "+15550002",
                "media_format": { "encoding": "base64", "sample_rate": "8000", "bit_rate": "128kbps" },
                "custom_parameters": { "lang": "en" }
            }
        })
        .to_string();

        let IncomingEvent::Start { stream_sid, start } = parse_event(&text).unwrap() else {
            panic!("expected start");
        };
        let metadata = start.metadata(stream_sid, "conn");
        assert_eq!(metadata.stream_sid, "abc");
        assert_eq!(metadata.call_sid.as_deref(), Some("call-9"));

        let default = AudioFormat::new(AudioEncoding::Mulaw, 16000);
        let format = start.media_format.unwrap().audio_format(default).unwrap();
        assert_eq!(format, AudioFormat::new(AudioEncoding::Pcm16, 8000));
    }

    #[test]
    fn test_parse_media_numeric() {
        let text = r#"{"event":"media","sequence_number":5,"media":{"chunk":4,"timestamp":"80","payload":"AAA="}}"#;
        let IncomingEvent::Media {
            sequence_number,
            media,
        } = parse_event(text).unwrap()
        else {
            panic!("expected media");
        };
        assert_eq!(sequence_number, Some(5));
        assert_eq!(media.chunk, Some(4));
        assert_eq!(media.payload, "AAA=");
    }

    #[test]
    fn test_parse_control_events() {
        assert!(matches!(
            parse_event(r#"{"event":"mark","stream_sid":"s","mark":{"name":"reply-1"}}"#).unwrap(),
            IncomingEvent::Mark { mark } if mark.name == "reply-1"
        ));
        assert!(matches!(
            parse_event(r#"{"event":"clear","stream_sid":"s"}"#).unwrap(),
            IncomingEvent::Clear { .. }
        ));
        assert!(matches!(
            parse_event(r#"{"event":"stop","stop":{"reason":"callended"}}"#).unwrap(),
            IncomingEvent::Stop { .. }
        ));
        assert!(matches!(
            parse_event(r#"{"event":"dtmf","dtmf":{"digit":"5","duration":"100"}}"#).unwrap(),
            IncomingEvent::Dtmf { dtmf } if dtmf.digit == "5" && dtmf.duration == Some(100)
        ));
    }

    #[test]
    fn test_unknown_and_malformed_events() {
        let event = parse_event(r#"{"event":"heartbeat","x":1}"#).unwrap();
        assert_eq!(event.name(), "unknown");

        assert!(matches!(
            parse_event("{not json"),
            Err(BridgeError::ProtocolError(_))
        ));
        assert!(matches!(
            parse_event(r#"{"event":"media"}"#),
            Err(BridgeError::ProtocolError(_))
        ));
    }

    #[test]
    fn test_media_format_rejections() {
        let default = AudioFormat::new(AudioEncoding::Pcm16, 8000);
        let stereo = MediaFormat {
            channels: Some(2),
            ..MediaFormat::default()
        };
        assert!(matches!(
            stereo.audio_format(default),
            Err(BridgeError::UnsupportedAudioFormat(_))
        ));

        let opus = MediaFormat {
            encoding: Some("opus".into()),
            ..MediaFormat::default()
        };
        assert!(opus.audio_format(default).is_err());

        assert_eq!(MediaFormat::default().audio_format(default).unwrap(), default);
    }

    #[test]
    fn test_sample_rate_bounds() {
        let default = AudioFormat::new(AudioEncoding::Pcm16, 8000);
        let with_rate = |rate: u64| MediaFormat {
            sample_rate: Some(rate),
            ..MediaFormat::default()
        };

        for rate in [0, 4000, 96_000, 400_000_000, u64::MAX] {
            assert!(
                matches!(
                    with_rate(rate).audio_format(default),
                    Err(BridgeError::UnsupportedAudioFormat(_))
                ),
                "rate {rate} should be rejected"
            );
        }
        assert_eq!(
            with_rate(16_000).audio_format(default).unwrap(),
            AudioFormat::new(AudioEncoding::Pcm16, 16_000)
        );
        assert_eq!(with_rate(48_000).audio_format(default).unwrap().sample_rate, 48_000);

        // Reaches the format through a real start event too
        let event = parse_event(
            r#"{"event":"start","start":{"stream_sid":"s","media_format":{"encoding":"pcm16","sample_rate":"400000000"}}}"#,
        )
        .unwrap();
        let IncomingEvent::Start { start, .. } = event else {
            panic!("expected start");
        };
        assert!(start.media_format.unwrap_or_default().audio_format(default).is_err());
    }

    #[test]
    fn test_outgoing_envelopes() {
        let media = OutgoingEvent::from_frame(
            "abc",
            OutboundFrame::Media {
                sequence_number: 3,
                chunk: 2,
                timestamp_ms: 100,
                payload: vec![0xFF, 0xFF],
            },
        );
        assert_eq!(
            serde_json::to_value(&media).unwrap(),
            json!({
                "event": "media",
                "stream_sid": "abc",
                "sequence_number": 3,
                "media": { "chunk": 2, "timestamp": "100", "payload": "//8=" }
            })
        );

        let mark = OutgoingEvent::from_frame(
            "abc",
            OutboundFrame::Mark {
                sequence_number: 4,
                name: "reply-1".into(),
            },
        );
        assert_eq!(
            serde_json::to_value(&mark).unwrap(),
            json!({ "event": "mark", "stream_sid": "abc", "sequence_number": 4, "mark": { "name": "reply-1" } })
        );

        let clear = OutgoingEvent::from_frame("abc", OutboundFrame::Clear { sequence_number: 5 });
        assert_eq!(
            serde_json::to_value(&clear).unwrap()["event"],
            json!("clear")
        );
    }
}
