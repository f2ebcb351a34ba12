pub mod codec;
pub mod pipeline;
pub mod session;
pub mod vad;

// Re-export commonly used types for convenience
pub use codec::{AudioEncoding, AudioFormat, CodecError};
pub use pipeline::{PipelineClient, PipelineError, TurnOutcome, VoicePipeline};
pub use session::{PipelineState, Session, SessionAction, SessionSettings};
pub use vad::{Segmenter, SegmenterConfig, Utterance};
