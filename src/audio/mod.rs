//! # Audio Module
//!
//! Everything between the microphone, the speakers and the live session.
//!
//! ## Key Components:
//! - **Codec**: float samples <-> base64 16-bit little-endian PCM
//! - **Capture**: microphone frames, resampled to 16kHz and sliced into fixed frames
//! - **Playback**: gapless scheduling of decoded buffers on one output timeline
//! - **Session**: the controller that owns one live voice session and its resources
//!
//! ## Audio Format Requirements:
//! - **Outbound**: 16kHz mono, 16-bit PCM, 4096 samples per frame
//! - **Inbound**: 24kHz mono, 16-bit PCM
//! - **Encoding**: Little-endian signed integers, base64 in JSON
//!
//! ## Platform Seams:
//! The hardware is reached only through the traits below. The desktop
//! implementation lives in `crate::device` (cpal); tests use in-memory fakes.

use crate::error::VoiceResult;
use serde::{Deserialize, Serialize};

pub mod capture;   // Microphone frames and the non-blocking outbound sender
pub mod codec;     // PCM encode/decode
pub mod playback;  // Output timeline scheduling
pub mod session;   // Live session lifecycle

/// Sample rate of captured audio on the wire.
pub const INPUT_SAMPLE_RATE: u32 = 16000;

/// Sample rate of audio produced by the live endpoint.
pub const OUTPUT_SAMPLE_RATE: u32 = 24000;

/// Samples per captured frame.
pub const FRAME_SIZE: usize = 4096;

/// MIME type attached to every outbound frame.
pub const INPUT_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// Identifier of a buffer scheduled on an output context.
pub type BufferId = u64;

/// Called once per captured frame (mono, input rate). Runs on the audio thread.
pub type FrameCallback = Box<dyn FnMut(&[f32]) + Send>;

/// Called by an output context when a scheduled buffer finishes playing.
/// Runs on the audio thread.
pub type EndedCallback = Box<dyn FnMut(BufferId) + Send>;

/// One encoded audio frame as it appears inside `realtimeInput.mediaChunks`.
///
/// ## Wire format:
/// ```json
/// { "mimeType": "audio/pcm;rate=16000", "data": "<base64>" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireAudioMessage {
    pub mime_type: String,
    pub data: String,
}

/// Decoded audio waiting to be played.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PlaybackBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    /// Duration in seconds (`len / sample_rate`).
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Opens the audio resources a session needs.
///
/// ## Rust Concepts:
/// - **trait objects**: The controller stores `Box<dyn ...>` so it does not care
///   whether it talks to cpal or a test fake
/// - **no Send bound**: The controller lives on one thread and cpal streams are `!Send`
pub trait AudioBackend {
    /// Open the capture-side context at the given wire rate.
    fn open_input(&mut self, sample_rate: u32) -> VoiceResult<Box<dyn AudioContext>>;

    /// Open the playback-side context. `on_ended` fires for each finished buffer.
    fn open_output(
        &mut self,
        sample_rate: u32,
        on_ended: EndedCallback,
    ) -> VoiceResult<Box<dyn OutputContext>>;

    /// Acquire the microphone. Fails with `Permission` or `Device` errors.
    fn request_microphone(&mut self, sample_rate: u32) -> VoiceResult<Box<dyn MediaStream>>;
}

/// A capture-side audio context.
pub trait AudioContext {
    fn close(&mut self);
    fn is_closed(&self) -> bool;
}

/// A live microphone stream.
pub trait MediaStream {
    /// Attach a processing node that delivers `frame_size`-sample frames at the
    /// stream's wire rate.
    fn connect(
        &mut self,
        frame_size: usize,
        on_frame: FrameCallback,
    ) -> VoiceResult<Box<dyn ProcessorNode>>;

    /// Enable or disable the hardware track (mute).
    fn set_enabled(&mut self, enabled: bool) -> VoiceResult<()>;

    /// Stop every track. Safe to call more than once.
    fn stop_tracks(&mut self);
}

/// The node that turns a microphone stream into frames.
pub trait ProcessorNode {
    /// Stop delivering frames. Safe to call more than once.
    fn disconnect(&mut self);
}

/// A playback-side audio context with its own clock.
pub trait OutputContext {
    /// Seconds since the context was opened.
    fn current_time(&self) -> f64;

    /// Start `buffer` at context time `at`.
    fn start_buffer(&mut self, id: BufferId, buffer: PlaybackBuffer, at: f64) -> VoiceResult<()>;

    /// Stop a buffer immediately. Unknown or finished ids are ignored.
    fn stop_buffer(&mut self, id: BufferId);

    fn close(&mut self);
    fn is_closed(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_duration() {
        let buffer = PlaybackBuffer::new(vec![0.0; 24000], OUTPUT_SAMPLE_RATE);
        assert!((buffer.duration() - 1.0).abs() < f64::EPSILON);
        assert_eq!(PlaybackBuffer::new(vec![], OUTPUT_SAMPLE_RATE).duration(), 0.0);
    }

    #[test]
    fn test_wire_message_field_names() {
        let msg = WireAudioMessage {
            mime_type: INPUT_MIME_TYPE.to_string(),
            data: "AAA=".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(json["data"], "AAA=");
    }
}
