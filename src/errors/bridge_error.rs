use thiserror::Error;

use crate::core::codec::CodecError;
use crate::core::pipeline::{PipelineError, Stage};

/// Failures inside a live call, grouped by how the relay reacts to them.
///
/// None of these end the process; most do not even end the call.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Undecodable audio frame; the frame is dropped
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Audio container the codec cannot handle; the frame or reply is dropped
    #[error("Unsupported audio format: {0}")]
    UnsupportedAudioFormat(String),

    /// Unparseable or out-of-order provider event; the event is ignored
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// A transcribe, generate or synthesize call failed; the turn is aborted
    #[error("Pipeline stage failed: {source}")]
    PipelineStageFailure {
        stage: Option<Stage>,
        #[source]
        source: PipelineError,
    },

    /// A lookup or late result for a session that no longer exists
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Socket-level failure; the session is torn down
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

impl From<CodecError> for BridgeError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::UnsupportedAudioFormat(msg) => Self::UnsupportedAudioFormat(msg),
            other => Self::MalformedFrame(other.to_string()),
        }
    }
}

impl From<PipelineError> for BridgeError {
    fn from(err: PipelineError) -> Self {
        Self::PipelineStageFailure {
            stage: err.stage(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::ProtocolError(err.to_string())
    }
}

impl From<axum::Error> for BridgeError {
    fn from(err: axum::Error) -> Self {
        Self::ConnectionError(err.to_string())
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
