//! # PCM Codec
//!
//! Converts between float samples in [-1, 1] and base64-encoded 16-bit
//! little-endian PCM, the format used on the live session wire.
//!
//! ## Conversion:
//! - **Encode**: clamp to [-1, 1], multiply by 32768 and round, saturate to
//!   the i16 range, pack as i16 LE, base64
//! - **Decode**: base64, read i16 LE, divide by 32768
//!
//! Both directions use the same scale, so a round trip stays within 1/32768
//! per sample (+1.0 saturates to 32767, exactly one step below).

use crate::audio::{PlaybackBuffer, WireAudioMessage, INPUT_MIME_TYPE};
use crate::error::{VoiceError, VoiceResult};
use base64::{engine::general_purpose, Engine as _};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Convert one float sample to i16 without wrapping.
fn to_pcm16(sample: f32) -> i16 {
    // NaN clamps to 0 so a bad sample cannot produce noise at full scale
    let clamped = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    (clamped * 32768.0)
        .round()
        .clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Encode a captured frame into an outbound wire message.
pub fn encode(samples: &[f32]) -> WireAudioMessage {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing to a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(to_pcm16(sample));
    }

    WireAudioMessage {
        mime_type: INPUT_MIME_TYPE.to_string(),
        data: general_purpose::STANDARD.encode(&bytes),
    }
}

/// Decode a base64 PCM payload into a playback buffer at `sample_rate`.
///
/// ## Errors:
/// - `VoiceError::Decode` for invalid base64 or an odd byte length
pub fn decode(data: &str, sample_rate: u32) -> VoiceResult<PlaybackBuffer> {
    let bytes = general_purpose::STANDARD.decode(data.trim())?;

    if bytes.len() % 2 != 0 {
        return Err(VoiceError::Decode(format!(
            "PCM payload has odd length {}",
            bytes.len()
        )));
    }

    let mut cursor = Cursor::new(&bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample as f32 / 32768.0);
    }

    Ok(PlaybackBuffer::new(samples, sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::OUTPUT_SAMPLE_RATE;

    #[test]
    fn test_round_trip_within_one_step() {
        let mut samples: Vec<f32> = (0..480)
            .map(|i| (i as f32 * 0.05).sin() * 0.8)
            .collect();
        samples.extend_from_slice(&[0.8, 0.5, -0.3, 0.99, 1.0, -1.0, 0.0]);

        let msg = encode(&samples);
        let buffer = decode(&msg.data, 16000).unwrap();

        assert_eq!(buffer.samples.len(), samples.len());
        for (original, decoded) in samples.iter().zip(buffer.samples.iter()) {
            assert!(
                (original - decoded).abs() <= 1.0 / 32768.0,
                "{} decoded as {}",
                original,
                decoded
            );
        }
    }

    #[test]
    fn test_out_of_range_input_is_clamped() {
        let msg = encode(&[2.0, -2.0, 1.0, -1.0]);
        let bytes = general_purpose::STANDARD.decode(&msg.data).unwrap();
        let mut cursor = Cursor::new(bytes);

        assert_eq!(cursor.read_i16::<LittleEndian>().unwrap(), i16::MAX);
        assert_eq!(cursor.read_i16::<LittleEndian>().unwrap(), i16::MIN);
        assert_eq!(cursor.read_i16::<LittleEndian>().unwrap(), i16::MAX);
        assert_eq!(cursor.read_i16::<LittleEndian>().unwrap(), i16::MIN);
    }

    #[test]
    fn test_nan_encodes_as_silence() {
        let msg = encode(&[f32::NAN]);
        let buffer = decode(&msg.data, 16000).unwrap();
        assert_eq!(buffer.samples, vec![0.0]);
    }

    #[test]
    fn test_encode_sets_mime_type() {
        let msg = encode(&[0.0; 4]);
        assert_eq!(msg.mime_type, "audio/pcm;rate=16000");
    }

    #[test]
    fn test_empty_input() {
        let msg = encode(&[]);
        assert!(msg.data.is_empty());

        let buffer = decode("", OUTPUT_SAMPLE_RATE).unwrap();
        assert!(buffer.is_empty());
        assert_eq!(buffer.sample_rate, OUTPUT_SAMPLE_RATE);
    }

    #[test]
    fn test_decode_scale() {
        // i16::MIN -> -1.0 exactly, 16384 -> 0.5
        let bytes = [0x00u8, 0x80, 0x00, 0x40];
        let data = general_purpose::STANDARD.encode(bytes);
        let buffer = decode(&data, OUTPUT_SAMPLE_RATE).unwrap();
        assert_eq!(buffer.samples, vec![-1.0, 0.5]);
    }

    #[test]
    fn test_decode_errors() {
        let odd = general_purpose::STANDARD.encode([1u8, 2, 3]);
        assert!(matches!(decode(&odd, OUTPUT_SAMPLE_RATE), Err(VoiceError::Decode(_))));
        assert!(matches!(
            decode("not base64!!", OUTPUT_SAMPLE_RATE),
            Err(VoiceError::Decode(_))
        ));
    }
}
