//! 16-bit PCM codec and the base64 text form used on the wire.

use crate::error::{Result, VoiceError};
use base64::{engine::general_purpose::STANDARD, Engine as _};

const NEGATIVE_SCALE: f32 = 32768.0;
const POSITIVE_SCALE: f32 = 32767.0;

/// Convert f32 samples to PCM 16-bit little-endian format.
///
/// Samples are clamped to [-1, 1]; negative values scale by 32768 and
/// non-negative values by 32767 so both ends of the i16 range are reachable.
pub fn encode(samples: &[f32]) -> Vec<u8> {
    let mut pcm_data = Vec::with_capacity(samples.len() * 2);

    for &sample in samples {
        pcm_data.extend_from_slice(&quantize(sample).to_le_bytes());
    }

    pcm_data
}

fn quantize(sample: f32) -> i16 {
    // NaN clamps to NaN, treat it as silence
    let clamped = if sample.is_nan() {
        0.0
    } else {
        sample.clamp(-1.0, 1.0)
    };
    let scaled = if clamped < 0.0 {
        clamped * NEGATIVE_SCALE
    } else {
        clamped * POSITIVE_SCALE
    };
    scaled.round() as i16
}

/// Inverse of [`encode`]: every value divides by 32768, so `i16::MAX`
/// comes back just under 1.0. A trailing odd byte is ignored.
pub fn decode(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / NEGATIVE_SCALE)
        .collect()
}

/// Decode a payload that must form a playable buffer: non-empty, whole samples.
pub fn decode_strict(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.is_empty() {
        return Err(VoiceError::Decode("empty audio payload".to_string()));
    }
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::Decode(format!(
            "payload of {} bytes is not whole 16-bit samples",
            bytes.len()
        )));
    }
    Ok(decode(bytes))
}

/// Bytes → transport-safe text.
pub fn to_transport_text(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Transport-safe text → bytes.
pub fn from_transport_text(text: &str) -> Result<Vec<u8>> {
    Ok(STANDARD.decode(text.trim())?)
}
