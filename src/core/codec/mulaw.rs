//! G.711 µ-law companding.

use super::{CodecError, PCM16_SAMPLE_WIDTH};

const BIAS: i32 = 0x84;
const CLIP: i32 = 32635;

/// Compress one linear sample to µ-law.
///
/// Negative samples are quantized on their one's complement magnitude so that
/// `-1` and `0` land in distinct codes and `i16::MIN` needs no negation.
#[inline]
pub fn linear_to_mulaw(sample: i16) -> u8 {
    let (sign, magnitude) = if sample < 0 {
        (0x80u8, i32::from(!sample))
    } else {
        (0x00u8, i32::from(sample))
    };

    let biased = magnitude.min(CLIP) + BIAS;
    // biased >> 7 lies in 1..=255, the segment is the index of its top bit
    let exponent = 7 - ((biased >> 7) as u8).leading_zeros() as i32;
    let mantissa = (biased >> (exponent + 3)) & 0x0F;

    !(sign | ((exponent as u8) << 4) | mantissa as u8)
}

/// Expand one µ-law code to a linear sample.
#[inline]
pub fn mulaw_to_linear(code: u8) -> i16 {
    let code = !code;
    let exponent = i32::from((code >> 4) & 0x07);
    let mantissa = i32::from(code & 0x0F);
    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;

    if code & 0x80 != 0 {
        !(magnitude as i16)
    } else {
        magnitude as i16
    }
}

/// Compress a PCM16 little-endian buffer. Output is half the input length.
pub fn pcm16_to_mulaw(pcm: &[u8]) -> Result<Vec<u8>, CodecError> {
    if pcm.len() % PCM16_SAMPLE_WIDTH != 0 {
        return Err(CodecError::InvalidLength {
            len: pcm.len(),
            width: PCM16_SAMPLE_WIDTH,
        });
    }

    Ok(pcm
        .chunks_exact(PCM16_SAMPLE_WIDTH)
        .map(|pair| linear_to_mulaw(i16::from_le_bytes([pair[0], pair[1]])))
        .collect())
}

/// Expand µ-law bytes into a PCM16 little-endian buffer.
pub fn mulaw_to_pcm16(mulaw: &[u8]) -> Vec<u8> {
    let mut pcm = Vec::with_capacity(mulaw.len() * PCM16_SAMPLE_WIDTH);
    for &code in mulaw {
        pcm.extend_from_slice(&mulaw_to_linear(code).to_le_bytes());
    }
    pcm
}
