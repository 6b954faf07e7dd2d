//! # PCM Codec
//!
//! Converts between the three representations audio takes on its way through
//! a live session:
//!
//! ```text
//!  base64 text  <-->  little-endian i16 bytes  <-->  f32 samples in [-1.0, 1.0]
//! ```
//!
//! ## Key Functions:
//! - [`decode`]: base64 text to raw bytes (`DecodeError` on malformed input)
//! - [`encode_samples`]: float samples to 16-bit little-endian bytes
//! - [`bytes_to_audio_buffer`]: interleaved 16-bit bytes to planar float channels
//!   (`FormatError` when the length does not divide into whole frames)
//! - [`encode_base64`], [`pcm_mime_type`], [`parse_pcm_rate`]: wire helpers
//!
//! ## Scaling:
//! Both directions use 32768 as the scale factor, so any i16 value survives
//! `i16 -> f32 -> i16` exactly.

use crate::audio::buffer::AudioBuffer;
use crate::error::LiveError;
use base64::{engine::general_purpose, Engine as _};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Scale factor between normalized floats and signed 16-bit PCM.
pub const PCM_SCALE: f32 = 32768.0;

/// Decode a base64 payload into raw bytes.
///
/// Strict standard alphabet: surrounding whitespace is malformed input too.
pub fn decode(base64: &str) -> Result<Vec<u8>, LiveError> {
    Ok(general_purpose::STANDARD.decode(base64)?)
}

/// Encode raw bytes as standard base64 (the alphabet the live API expects).
pub fn encode_base64(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

/// Quantize one normalized sample to i16.
///
/// Multiplies by 32768, clamps to the i16 range and truncates toward zero.
pub fn quantize(sample: f32) -> i16 {
    (sample * PCM_SCALE).clamp(-32768.0, 32767.0) as i16
}

/// Encode float samples as 16-bit little-endian PCM bytes.
pub fn encode_samples(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing into a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(quantize(sample));
    }
    bytes
}

/// Encode already-quantized samples as 16-bit little-endian PCM bytes.
pub fn encode_pcm(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let _ = bytes.write_i16::<LittleEndian>(sample);
    }
    bytes
}

/// De-interleave 16-bit little-endian PCM into a planar float buffer.
///
/// ## Layout:
/// Sample `i` of channel `c` is read from index `i * channel_count + c`, and
/// every sample is divided by 32768.0.
///
/// ## Errors:
/// `FormatError` when `channel_count` is zero or the byte length is not a
/// multiple of `channel_count * 2`.
pub fn bytes_to_audio_buffer(
    bytes: &[u8],
    sample_rate: u32,
    channel_count: u16,
) -> Result<AudioBuffer, LiveError> {
    if channel_count == 0 {
        return Err(LiveError::Format("channel count must be at least 1".to_string()));
    }

    let frame_bytes = channel_count as usize * 2;
    if bytes.len() % frame_bytes != 0 {
        return Err(LiveError::Format(format!(
            "byte length {} is not a multiple of {} ({} channel(s) of 16-bit samples)",
            bytes.len(),
            frame_bytes,
            channel_count
        )));
    }

    let frame_count = bytes.len() / frame_bytes;
    let mut channels = vec![Vec::with_capacity(frame_count); channel_count as usize];
    let mut cursor = Cursor::new(bytes);

    for _ in 0..frame_count {
        for channel in channels.iter_mut() {
            let sample = cursor
                .read_i16::<LittleEndian>()
                .map_err(|e| LiveError::Decode(format!("truncated PCM data: {}", e)))?;
            channel.push(sample as f32 / PCM_SCALE);
        }
    }

    Ok(AudioBuffer::new(sample_rate, channels))
}

/// Decode a base64 PCM chunk straight into a playback buffer.
pub fn decode_chunk(base64: &str, sample_rate: u32, channel_count: u16) -> Result<AudioBuffer, LiveError> {
    let bytes = decode(base64)?;
    bytes_to_audio_buffer(&bytes, sample_rate, channel_count)
}

/// Mime type announced for raw PCM at the given rate, e.g. `audio/pcm;rate=16000`.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Extract the `rate=` parameter from a PCM mime type.
///
/// Returns `None` when the parameter is missing or not a number, and also when
/// the base type is not `audio/pcm`.
pub fn parse_pcm_rate(mime_type: &str) -> Option<u32> {
    let mut parts = mime_type.split(';').map(str::trim);
    let base = parts.next()?;
    if !base.eq_ignore_ascii_case("audio/pcm") {
        return None;
    }
    parts
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rejects_malformed_base64() {
        let err = decode("this is *not* base64").unwrap_err();
        assert!(matches!(err, LiveError::Decode(_)));
    }

    #[test]
    fn test_decode_rejects_surrounding_whitespace() {
        assert_eq!(decode("AAAA").unwrap(), vec![0, 0, 0]);
        assert!(matches!(decode(" AAAA\n"), Err(LiveError::Decode(_))));
        assert!(matches!(decode("AAAA\n"), Err(LiveError::Decode(_))));
    }

    #[test]
    fn test_encode_samples_scales_and_truncates() {
        let bytes = encode_samples(&[0.0, 0.5, -0.25, 1.0, -1.0, 0.00002]);
        let expected: Vec<u8> = [0i16, 16384, -8192, 32767, -32768, 0]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_odd_length_with_two_channels_is_format_error() {
        let err = bytes_to_audio_buffer(&[0u8; 5], 24000, 2).unwrap_err();
        assert!(matches!(err, LiveError::Format(_)));
    }

    #[test]
    fn test_zero_channels_is_format_error() {
        assert!(matches!(
            bytes_to_audio_buffer(&[0u8; 4], 24000, 0),
            Err(LiveError::Format(_))
        ));
    }

    #[test]
    fn test_deinterleaves_stereo() {
        // L0 R0 L1 R1
        let bytes = encode_pcm(&[16384, -16384, 8192, 0]);
        let buffer = bytes_to_audio_buffer(&bytes, 24000, 2).unwrap();
        assert_eq!(buffer.channel_count(), 2);
        assert_eq!(buffer.frame_count(), 2);
        assert_eq!(buffer.channel(0), &[0.5, 0.25]);
        assert_eq!(buffer.channel(1), &[-0.5, 0.0]);
    }

    #[test]
    fn test_base64_pcm_round_trip_within_one_step() {
        let known: Vec<i16> = vec![0, 1, -1, 12345, -12345, 32767, -32768, 20000];
        let wire = encode_base64(&encode_pcm(&known));

        let buffer = decode_chunk(&wire, 16000, 1).unwrap();
        for (original, decoded) in known.iter().zip(buffer.channel(0)) {
            let expected = *original as f32 / 32768.0;
            assert!((expected - decoded).abs() <= 1.0 / 32768.0);
        }

        // And back to bytes again
        let reencoded = encode_samples(buffer.channel(0));
        assert_eq!(reencoded, encode_pcm(&known));
    }

    #[test]
    fn test_mime_type_helpers() {
        assert_eq!(pcm_mime_type(16000), "audio/pcm;rate=16000");
        assert_eq!(parse_pcm_rate("audio/pcm;rate=24000"), Some(24000));
        assert_eq!(parse_pcm_rate("audio/pcm; rate = 8000"), Some(8000));
        assert_eq!(parse_pcm_rate("audio/pcm"), None);
        assert_eq!(parse_pcm_rate("audio/wav;rate=24000"), None);
    }
}
