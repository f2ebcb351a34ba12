//! Audio frame codec
//!
//! Pure conversions between the telephony wire representation (base64 text
//! carrying µ-law or 16-bit little-endian PCM) and the PCM16 buffers used for
//! voice activity detection and WAV construction.
//!
//! Everything in this module is synchronous and allocation-bounded by its
//! input; nothing here touches the network or the session state.

mod frame;
mod mulaw;
mod resample;
mod wav;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use frame::{decode_base64, decode_frame, encode_frame};
pub use mulaw::{linear_to_mulaw, mulaw_to_linear, mulaw_to_pcm16, pcm16_to_mulaw};
pub use resample::{downmix_to_mono, resample_pcm16};
pub use wav::{WAV_HEADER_LEN, WavAudio, WavFormat, create_header, parse_wav, wrap_wav};

/// Bytes per PCM16 sample.
pub const PCM16_SAMPLE_WIDTH: usize = 2;

/// Sample rates a call stream may announce, in Hz.
pub const SUPPORTED_SAMPLE_RATES: std::ops::RangeInclusive<u32> = 8_000..=48_000;

/// Errors raised by the codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Payload was not valid base64 or its length does not fit the sample width
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// WAV container with an unknown format code or without a data chunk
    #[error("Unsupported audio format: {0}")]
    UnsupportedAudioFormat(String),

    /// Buffer length is not a whole number of samples
    #[error("Invalid buffer length {len}: expected a multiple of {width}")]
    InvalidLength { len: usize, width: usize },
}

/// Sample encoding carried on the telephony channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioEncoding {
    /// G.711 µ-law, one byte per sample
    Mulaw,
    /// Signed 16-bit little-endian linear PCM
    Pcm16,
}

impl AudioEncoding {
    /// Parse an encoding name as used by providers and synthesis vendors.
    ///
    /// Exotel announces its stream as `base64`/`raw` which carries PCM16, so
    /// those names map to [`AudioEncoding::Pcm16`].
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "mulaw" | "ulaw" | "mu-law" | "pcmu" | "audio/x-mulaw" | "audio/basic" | "g711_ulaw" => {
                Some(Self::Mulaw)
            }
            "pcm" | "pcm16" | "linear16" | "s16le" | "slin" | "raw" | "base64" | "audio/l16"
            | "pcm_s16le" => Some(Self::Pcm16),
            _ => None,
        }
    }

    /// Name used on the wire when requesting audio from a vendor.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mulaw => "mulaw",
            Self::Pcm16 => "pcm16",
        }
    }

    /// Bytes occupied by one sample in this encoding.
    pub fn sample_width(&self) -> usize {
        match self {
            Self::Mulaw => 1,
            Self::Pcm16 => PCM16_SAMPLE_WIDTH,
        }
    }
}

impl fmt::Display for AudioEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoding and rate of a mono audio stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
}

impl AudioFormat {
    pub const fn new(encoding: AudioEncoding, sample_rate: u32) -> Self {
        Self {
            encoding,
            sample_rate,
        }
    }

    /// Number of encoded bytes covering `ms` milliseconds of audio.
    pub fn bytes_for_ms(&self, ms: u64) -> usize {
        let samples = (u64::from(self.sample_rate) * ms / 1000) as usize;
        samples.max(1) * self.encoding.sample_width()
    }
}

/// Convert encoded channel audio into PCM16.
pub fn to_pcm16(audio: &[u8], encoding: AudioEncoding) -> Result<Vec<u8>, CodecError> {
    match encoding {
        AudioEncoding::Mulaw => Ok(mulaw_to_pcm16(audio)),
        AudioEncoding::Pcm16 => {
            if audio.len() % PCM16_SAMPLE_WIDTH != 0 {
                return Err(CodecError::InvalidLength {
                    len: audio.len(),
                    width: PCM16_SAMPLE_WIDTH,
                });
            }
            Ok(audio.to_vec())
        }
    }
}

/// Encode PCM16 into the given channel encoding.
pub fn from_pcm16(pcm: &[u8], encoding: AudioEncoding) -> Result<Vec<u8>, CodecError> {
    match encoding {
        AudioEncoding::Mulaw => pcm16_to_mulaw(pcm),
        AudioEncoding::Pcm16 => to_pcm16(pcm, AudioEncoding::Pcm16),
    }
}

/// Convert mono audio between formats, resampling when the rates differ.
pub fn convert_audio(
    audio: &[u8],
    from: AudioFormat,
    to: AudioFormat,
) -> Result<Vec<u8>, CodecError> {
    if from == to {
        return Ok(audio.to_vec());
    }

    let pcm = to_pcm16(audio, from.encoding)?;
    let pcm = if from.sample_rate != to.sample_rate {
        resample_pcm16(&pcm, from.sample_rate, to.sample_rate)
    } else {
        pcm
    };
    from_pcm16(&pcm, to.encoding)
}
