//! External pipeline client
//!
//! One caller utterance becomes one turn: transcribe → generate → synthesize,
//! executed strictly in sequence. Each stage sits behind its own trait so the
//! HTTP adapters can be swapped for in-process implementations in tests.
//!
//! # Failure semantics
//!
//! - An empty transcript ends the turn as [`TurnOutcome::NoSpeech`]; generate
//!   and synthesize are never called.
//! - A failed or empty generation falls back to a configured apology when one
//!   is set; otherwise the turn fails.
//! - Any other stage failure or timeout fails only this turn.

mod client;
mod error;
mod http;
mod messages;
mod retry;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

use crate::core::codec::AudioFormat;
use crate::core::vad::Utterance;

pub use client::{PipelineClient, PipelineSettings, normalize_synthesized};
pub use error::{PipelineError, Stage};
pub use http::{Endpoint, HttpReplyGenerator, HttpSynthesizer, HttpTranscriber};
pub use retry::RetryPolicy;

/// Result of the transcription stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub confidence: Option<f32>,
    pub language: Option<String>,
}

impl Transcript {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One line of conversation history sent with each generate request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub text: String,
}

/// Conversation context for reply generation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyContext {
    pub session_id: String,
    pub system_prompt: Option<String>,
    pub history: Vec<HistoryEntry>,
}

/// Raw output of the synthesis stage, before local conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizedAudio {
    pub audio: Vec<u8>,
    /// Encoding claimed by the vendor, if any
    pub encoding: Option<String>,
    /// Sample rate claimed by the vendor, if any
    pub sample_rate: Option<u32>,
}

/// Everything needed to run one turn.
#[derive(Debug, Clone)]
pub struct TurnInput {
    pub utterance: Utterance,
    pub context: ReplyContext,
    /// Encoding and rate the telephony channel expects back
    pub target: AudioFormat,
}

/// Output of a successful turn, ready to be framed onto the socket.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineResult {
    pub transcript: Transcript,
    pub reply_text: String,
    /// Reply audio already converted to `format`
    pub audio: Vec<u8>,
    pub format: AudioFormat,
    /// The reply is the configured fallback, not a generated answer
    pub used_fallback: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The caller said nothing intelligible
    NoSpeech,
    Reply(PipelineResult),
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe a complete WAV file.
    async fn transcribe(
        &self,
        wav: Bytes,
        language_hint: Option<&str>,
    ) -> Result<Transcript, PipelineError>;
}

#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate_reply(
        &self,
        user_text: &str,
        context: &ReplyContext,
    ) -> Result<String, PipelineError>;
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Request speech for `text`, asking for the channel's format.
    async fn synthesize(
        &self,
        text: &str,
        target: AudioFormat,
    ) -> Result<SynthesizedAudio, PipelineError>;
}

/// A complete turn runner as seen by the media relay.
#[async_trait]
pub trait VoicePipeline: Send + Sync {
    async fn run_turn(&self, input: TurnInput) -> Result<TurnOutcome, PipelineError>;

    /// Transcribe without replying. Used for trailing audio after hang-up.
    async fn transcribe_only(&self, utterance: Utterance) -> Result<Transcript, PipelineError>;
}
