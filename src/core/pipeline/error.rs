use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::core::codec::CodecError;

/// The three sequential stages of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Transcribe,
    Generate,
    Synthesize,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transcribe => "transcribe",
            Self::Generate => "generate",
            Self::Synthesize => "synthesize",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while running a turn through the external services.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The request never produced an HTTP response
    #[error("{stage} request failed: {reason}")]
    Request {
        stage: Stage,
        reason: String,
        retryable: bool,
    },

    /// The service answered with a non-2xx status
    #[error("{stage} returned HTTP {status}: {body}")]
    Status {
        stage: Stage,
        status: u16,
        body: String,
    },

    /// The stage exceeded its deadline
    #[error("{stage} timed out after {timeout_ms}ms")]
    Timeout { stage: Stage, timeout_ms: u64 },

    /// The body could not be understood
    #[error("{stage} returned an invalid response: {reason}")]
    InvalidResponse { stage: Stage, reason: String },

    /// Synthesized audio could not be converted for the channel
    #[error("{stage} audio could not be converted: {source}")]
    Audio {
        stage: Stage,
        #[source]
        source: CodecError,
    },

    /// Client could not be built from configuration
    #[error("Invalid pipeline configuration: {0}")]
    Configuration(String),

    /// The turn task panicked before producing a result
    #[error("Turn aborted: {0}")]
    Aborted(String),
}

impl PipelineError {
    /// Build a request error from a reqwest failure.
    pub fn from_reqwest(stage: Stage, err: reqwest::Error) -> Self {
        let retryable = err.is_connect() || err.is_timeout() || err.is_request();
        Self::Request {
            stage,
            reason: err.to_string(),
            retryable,
        }
    }

    /// Stage this error belongs to, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Request { stage, .. }
            | Self::Status { stage, .. }
            | Self::Timeout { stage, .. }
            | Self::InvalidResponse { stage, .. }
            | Self::Audio { stage, .. } => Some(*stage),
            Self::Configuration(_) | Self::Aborted(_) => None,
        }
    }

    /// Transient failures worth another attempt: connection problems,
    /// throttling and server-side errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Request { retryable, .. } => *retryable,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let server = PipelineError::Status {
            stage: Stage::Generate,
            status: 503,
            body: String::new(),
        };
        let throttled = PipelineError::Status {
            stage: Stage::Generate,
            status: 429,
            body: String::new(),
        };
        let client = PipelineError::Status {
            stage: Stage::Generate,
            status: 400,
            body: String::new(),
        };
        let timeout = PipelineError::Timeout {
            stage: Stage::Synthesize,
            timeout_ms: 10,
        };

        assert!(server.is_retryable());
        assert!(throttled.is_retryable());
        assert!(!client.is_retryable());
        assert!(!timeout.is_retryable());
    }

    #[test]
    fn test_stage_and_display() {
        let err = PipelineError::Timeout {
            stage: Stage::Transcribe,
            timeout_ms: 12000,
        };
        assert_eq!(err.stage(), Some(Stage::Transcribe));
        assert_eq!(err.to_string(), "transcribe timed out after 12000ms");
        assert_eq!(PipelineError::Configuration("x".into()).stage(), None);
        let aborted = PipelineError::Aborted("boom".into());
        assert_eq!(aborted.stage(), None);
        assert!(!aborted.is_retryable());
    }
}
