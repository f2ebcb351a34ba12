//! RIFF/WAVE container handling.

use super::{AudioEncoding, CodecError};

/// Size of the canonical header written by [`wrap_wav`].
pub const WAV_HEADER_LEN: usize = 44;

/// Audio format codes accepted in the `fmt ` chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WavFormat {
    /// WAVE_FORMAT_PCM (1)
    Pcm,
    /// WAVE_FORMAT_MULAW (7)
    Mulaw,
}

impl WavFormat {
    pub fn code(&self) -> u16 {
        match self {
            Self::Pcm => 1,
            Self::Mulaw => 7,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(Self::Pcm),
            7 => Some(Self::Mulaw),
            _ => None,
        }
    }

    /// Channel encoding matching this container format.
    pub fn encoding(&self) -> AudioEncoding {
        match self {
            Self::Pcm => AudioEncoding::Pcm16,
            Self::Mulaw => AudioEncoding::Mulaw,
        }
    }
}

/// Parsed WAV file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WavAudio {
    pub format: WavFormat,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub data: Vec<u8>,
}

/// Build the 44-byte header of a canonical WAV file.
///
/// # Arguments
/// * `format` - Audio format code written to the `fmt ` chunk
/// * `data_size` - Size of the audio data in bytes
/// * `sample_rate` - Sample rate in Hz (e.g., 8000)
/// * `channels` - Number of channels (1 for mono)
/// * `bits_per_sample` - Bits per sample (16 for PCM, 8 for µ-law)
pub fn create_header(
    format: WavFormat,
    data_size: u32,
    sample_rate: u32,
    channels: u16,
    bits_per_sample: u16,
) -> [u8; WAV_HEADER_LEN] {
    let frame_bits = u64::from(channels) * u64::from(bits_per_sample);
    let byte_rate = u32::try_from(u64::from(sample_rate) * frame_bits / 8).unwrap_or(u32::MAX);
    let block_align = u16::try_from(frame_bits / 8).unwrap_or(u16::MAX);
    // RIFF size excludes the 8 bytes of the RIFF chunk header itself
    let riff_size = 36u32.saturating_add(data_size);

    let mut header = [0u8; WAV_HEADER_LEN];

    header[0..4].copy_from_slice(b"RIFF");
    header[4..8].copy_from_slice(&riff_size.to_le_bytes());
    header[8..12].copy_from_slice(b"WAVE");

    header[12..16].copy_from_slice(b"fmt ");
    header[16..20].copy_from_slice(&16u32.to_le_bytes());
    header[20..22].copy_from_slice(&format.code().to_le_bytes());
    header[22..24].copy_from_slice(&channels.to_le_bytes());
    header[24..28].copy_from_slice(&sample_rate.to_le_bytes());
    header[28..32].copy_from_slice(&byte_rate.to_le_bytes());
    header[32..34].copy_from_slice(&block_align.to_le_bytes());
    header[34..36].copy_from_slice(&bits_per_sample.to_le_bytes());

    header[36..40].copy_from_slice(b"data");
    header[40..44].copy_from_slice(&data_size.to_le_bytes());

    header
}

/// Wrap raw PCM bytes in a canonical 44-byte RIFF/WAVE header.
pub fn wrap_wav(pcm: &[u8], sample_rate: u32, channels: u16, bits_per_sample: u16) -> Vec<u8> {
    let header = create_header(
        WavFormat::Pcm,
        pcm.len() as u32,
        sample_rate,
        channels,
        bits_per_sample,
    );
    let mut wav = Vec::with_capacity(WAV_HEADER_LEN + pcm.len());
    wav.extend_from_slice(&header);
    wav.extend_from_slice(pcm);
    wav
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Parse a WAV file, walking its chunk list.
///
/// Unknown chunks (`LIST`, `fact`, ...) are skipped. A `data` chunk whose
/// declared size runs past the buffer, as streaming encoders emit, is clamped
/// to the bytes actually present.
pub fn parse_wav(bytes: &[u8]) -> Result<WavAudio, CodecError> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(CodecError::UnsupportedAudioFormat(
            "missing RIFF/WAVE header".to_string(),
        ));
    }

    let mut fmt: Option<(WavFormat, u16, u32, u16)> = None;
    let mut offset = 12;

    while offset + 8 <= bytes.len() {
        let chunk_id = &bytes[offset..offset + 4];
        let chunk_size = read_u32(bytes, offset + 4) as usize;
        let body = offset + 8;
        let available = bytes.len() - body;

        match chunk_id {
            b"fmt " => {
                if chunk_size < 16 || available < 16 {
                    return Err(CodecError::UnsupportedAudioFormat(
                        "truncated fmt chunk".to_string(),
                    ));
                }
                let code = read_u16(bytes, body);
                let format = WavFormat::from_code(code).ok_or_else(|| {
                    CodecError::UnsupportedAudioFormat(format!("audio format code {code}"))
                })?;
                fmt = Some((
                    format,
                    read_u16(bytes, body + 2),
                    read_u32(bytes, body + 4),
                    read_u16(bytes, body + 14),
                ));
            }
            b"data" => {
                let (format, channels, sample_rate, bits_per_sample) = fmt.ok_or_else(|| {
                    CodecError::UnsupportedAudioFormat("data chunk before fmt chunk".to_string())
                })?;
                let len = chunk_size.min(available);
                return Ok(WavAudio {
                    format,
                    sample_rate,
                    channels,
                    bits_per_sample,
                    data: bytes[body..body + len].to_vec(),
                });
            }
            _ => {}
        }

        // Chunks are word aligned
        let padded = chunk_size.saturating_add(chunk_size & 1);
        offset = body.saturating_add(padded);
    }

    Err(CodecError::UnsupportedAudioFormat(
        "no data chunk found".to_string(),
    ))
}
