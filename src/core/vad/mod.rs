//! Energy-based voice activity segmentation.
//!
//! The segmenter works on PCM16 packets as they arrive from the call and cuts
//! the stream into utterances at sustained silence. Time is measured in audio
//! samples, never wall clock, so segmentation is deterministic for a given
//! input stream.

mod segmenter;

pub use segmenter::{Segmenter, SegmenterConfig, SegmenterEvent, Utterance};

/// Scale factor to normalize 16-bit PCM into [-1.0, 1.0).
const PCM_TO_FLOAT_SCALE: f32 = 1.0 / 32768.0;

/// Normalized root-mean-square energy of a PCM16 little-endian buffer.
///
/// Returns 0.0 for buffers shorter than one sample.
pub fn rms_energy(pcm: &[u8]) -> f32 {
    if pcm.len() < 2 {
        return 0.0;
    }

    let mut sum_squares = 0.0f32;
    let sample_count = pcm.len() / 2;

    for chunk in pcm.chunks_exact(2) {
        let sample = i16::from_le_bytes([chunk[0], chunk[1]]) as f32 * PCM_TO_FLOAT_SCALE;
        sum_squares += sample * sample;
    }

    (sum_squares / sample_count as f32).sqrt()
}
