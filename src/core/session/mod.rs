//! Per-call session state.
//!
//! A [`Session`] owns everything one telephony stream needs between events:
//! the segmenter, the pipeline state, the outbound queue and the sequence
//! counters. It performs no I/O. Callers feed it provider events and
//! pipeline results and execute the [`SessionAction`]s it returns.

mod machine;
mod registry;

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::config::ServerConfig;
use crate::core::codec::{AudioEncoding, AudioFormat};
use crate::core::pipeline::TurnInput;
use crate::core::vad::SegmenterConfig;

pub use machine::Session;
pub use registry::SessionRegistry;

/// What to do when the caller speaks while a reply is pending or playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BargeInPolicy {
    /// Keep the caller's audio for the next turn; the reply plays out
    #[default]
    Queue,
    /// Cancel the turn and clear playback as soon as speech starts
    Interrupt,
}

impl FromStr for BargeInPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queue" => Ok(Self::Queue),
            "interrupt" => Ok(Self::Interrupt),
            other => Err(format!(
                "Invalid barge-in policy '{other}': expected 'queue' or 'interrupt'"
            )),
        }
    }
}

/// What to do with speech still buffered when the stream stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrailingAudioPolicy {
    #[default]
    Discard,
    /// Transcribe it for the logs; no reply can be delivered
    Process,
}

impl FromStr for TrailingAudioPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "discard" => Ok(Self::Discard),
            "process" => Ok(Self::Process),
            other => Err(format!(
                "Invalid trailing audio policy '{other}': expected 'discard' or 'process'"
            )),
        }
    }
}

/// Static per-session behaviour, derived once from the server configuration.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub segmenter: SegmenterConfig,
    /// Channel format assumed until the start event says otherwise
    pub default_format: AudioFormat,
    pub barge_in: BargeInPolicy,
    pub trailing_audio: TrailingAudioPolicy,
    /// Media frames kept while waiting for the start event
    pub pre_start_buffer_frames: usize,
    /// Duration of each outbound media frame
    pub outbound_chunk_ms: u64,
    /// User/assistant exchanges kept as generation context
    pub max_history_turns: usize,
    pub system_prompt: Option<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            segmenter: SegmenterConfig::default(),
            default_format: AudioFormat::new(AudioEncoding::Pcm16, 8000),
            barge_in: BargeInPolicy::Queue,
            trailing_audio: TrailingAudioPolicy::Discard,
            pre_start_buffer_frames: 50,
            outbound_chunk_ms: 100,
            max_history_turns: 10,
            system_prompt: None,
        }
    }
}

impl SessionSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            segmenter: config.segmenter_config(),
            default_format: AudioFormat::new(AudioEncoding::Pcm16, config.default_sample_rate),
            barge_in: config.barge_in,
            trailing_audio: config.trailing_audio,
            pre_start_buffer_frames: config.pre_start_buffer_frames,
            outbound_chunk_ms: config.outbound_chunk_ms,
            max_history_turns: config.max_history_turns,
            system_prompt: config.system_prompt.clone(),
        }
    }
}

/// Pipeline state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Connected, waiting for the start event
    Idle,
    Listening,
    /// A turn is in flight
    Processing { turn_id: u64 },
    /// Reply audio is being streamed out
    Speaking { turn_id: u64 },
    Closed,
}

impl PipelineState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Processing { .. } => "processing",
            Self::Speaking { .. } => "speaking",
            Self::Closed => "closed",
        }
    }

    /// Turn currently owning the pipeline, if any.
    pub fn active_turn(&self) -> Option<u64> {
        match self {
            Self::Processing { turn_id } | Self::Speaking { turn_id } => Some(*turn_id),
            _ => None,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Call identity announced in the start event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CallMetadata {
    pub stream_sid: String,
    pub call_sid: Option<String>,
    pub account_sid: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

/// Counters stamped onto outbound events.
///
/// `sequence_number` is shared by media, mark and clear events and always
/// holds the last value issued. `media_chunks` counts media events only and
/// has no gaps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SequenceCounters {
    pub sequence_number: u64,
    pub media_chunks: u64,
    pub marks: u64,
}

impl SequenceCounters {
    fn next_sequence(&mut self) -> u64 {
        self.sequence_number += 1;
        self.sequence_number
    }

    fn next_chunk(&mut self) -> u64 {
        self.media_chunks += 1;
        self.media_chunks
    }
}

/// An outbound event with its counters already assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Media {
        sequence_number: u64,
        chunk: u64,
        /// Playback offset of this frame within the session's outbound audio
        timestamp_ms: u64,
        /// Encoded channel audio, not yet base64
        payload: Vec<u8>,
    },
    Mark {
        sequence_number: u64,
        name: String,
    },
    Clear {
        sequence_number: u64,
    },
}

impl OutboundFrame {
    pub fn sequence_number(&self) -> u64 {
        match self {
            Self::Media { sequence_number, .. }
            | Self::Mark { sequence_number, .. }
            | Self::Clear { sequence_number } => *sequence_number,
        }
    }
}

/// Side effects requested by the session.
#[derive(Debug)]
pub enum SessionAction {
    /// Run a turn through the pipeline
    StartTurn { turn_id: u64, input: TurnInput },
    /// Abandon an in-flight turn; its result will be ignored
    CancelTurn { turn_id: u64 },
    /// Send immediately, ahead of any queued playback
    Send(OutboundFrame),
    /// Reply audio was queued; drain it with [`Session::next_outbound`]
    PlaybackQueued { turn_id: u64, frames: usize },
}

/// Read-only view of a session for the HTTP API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub connection_id: String,
    pub stream_sid: Option<String>,
    pub call_sid: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub state: &'static str,
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
    pub turns_completed: u64,
    pub turns_failed: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub sequence_number: u64,
    pub started_at_secs: u64,
}

/// Mark name sent after the last media frame of a turn's reply.
pub fn reply_mark_name(turn_id: u64) -> String {
    format!("reply-{turn_id}")
}
