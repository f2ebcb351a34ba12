use base64::{Engine, engine::general_purpose::STANDARD};

use super::{AudioEncoding, CodecError};

/// Decode a base64 payload without checking the sample width.
pub fn decode_base64(payload: &str) -> Result<Vec<u8>, CodecError> {
    STANDARD
        .decode(payload.trim())
        .map_err(|e| CodecError::MalformedFrame(format!("invalid base64 payload: {e}")))
}

/// Decode one media frame from its base64 wire form.
///
/// PCM16 payloads must carry whole samples; an odd byte count is reported as
/// [`CodecError::MalformedFrame`].
pub fn decode_frame(payload: &str, encoding: AudioEncoding) -> Result<Vec<u8>, CodecError> {
    let bytes = decode_base64(payload)?;

    let width = encoding.sample_width();
    if bytes.len() % width != 0 {
        return Err(CodecError::MalformedFrame(format!(
            "{} byte payload is not a multiple of the {encoding} sample width ({width})",
            bytes.len()
        )));
    }

    Ok(bytes)
}

/// Encode audio bytes for an outbound media frame.
pub fn encode_frame(audio: &[u8]) -> String {
    STANDARD.encode(audio)
}
