//! # Capture Pipeline
//!
//! Turns raw microphone callbacks into fixed-size 16kHz mono frames and pushes
//! each frame, encoded, towards the live session.
//!
//! ## Flow (all inside the hardware callback):
//! 1. Mix interleaved device samples down to mono
//! 2. Resample from the device rate to 16kHz (rubato)
//! 3. Slice into `frame_size` frames
//! 4. Encode and `try_send` to the session writer
//!
//! There is no backpressure: when the outbound queue is full the frame is
//! dropped and counted.

use crate::audio::codec;
use crate::audio::{FrameCallback, MediaStream, ProcessorNode, WireAudioMessage};
use crate::error::{VoiceError, VoiceResult};
use rubato::{FftFixedInOut, Resampler};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Input chunk size handed to the resampler.
const RESAMPLER_CHUNK: usize = 1024;

/// Accumulates device audio and emits fixed-size frames at the wire rate.
pub struct FrameSlicer {
    channels: usize,
    frame_size: usize,
    resampler: Option<FftFixedInOut<f32>>,
    /// Mono samples at the device rate, waiting for a full resampler chunk
    pending_in: Vec<f32>,
    /// Mono samples at the wire rate, waiting for a full frame
    pending_out: Vec<f32>,
    /// Resampler output, allocated once
    resampled: Vec<Vec<f32>>,
}

impl FrameSlicer {
    pub fn new(device_rate: u32, channels: usize, wire_rate: u32, frame_size: usize) -> VoiceResult<Self> {
        let resampler = if device_rate != wire_rate {
            let resampler = FftFixedInOut::<f32>::new(
                device_rate as usize,
                wire_rate as usize,
                RESAMPLER_CHUNK,
                1, // mono
            )
            .map_err(|e| VoiceError::Audio(format!("Failed to create resampler: {e}")))?;
            debug!("Created resampler: {} Hz -> {} Hz", device_rate, wire_rate);
            Some(resampler)
        } else {
            None
        };

        let resampled = resampler
            .as_ref()
            .map(|resampler| resampler.output_buffer_allocate(true))
            .unwrap_or_default();

        Ok(Self {
            channels: channels.max(1),
            frame_size: frame_size.max(1),
            resampler,
            pending_in: Vec::with_capacity(RESAMPLER_CHUNK * 2),
            pending_out: Vec::with_capacity(frame_size * 2),
            resampled,
        })
    }

    /// Feed interleaved device samples; `emit` is called once per complete frame.
    pub fn push(&mut self, interleaved: &[f32], mut emit: impl FnMut(&[f32])) {
        let channels = self.channels;
        if channels > 1 {
            self.pending_in.extend(
                interleaved
                    .chunks(channels)
                    .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32),
            );
        } else {
            self.pending_in.extend_from_slice(interleaved);
        }

        match self.resampler.as_mut() {
            Some(resampler) => loop {
                let needed = resampler.input_frames_next();
                if self.pending_in.len() < needed {
                    break;
                }
                match resampler.process_into_buffer(
                    &[&self.pending_in[..needed]],
                    self.resampled.as_mut_slice(),
                    None,
                ) {
                    Ok((_, written)) => {
                        if let Some(mono) = self.resampled.first() {
                            self.pending_out.extend_from_slice(&mono[..written]);
                        }
                    }
                    Err(e) => warn!("Resample error: {e}"),
                }
                self.pending_in.drain(..needed);
            },
            None => self.pending_out.append(&mut self.pending_in),
        }

        let mut offset = 0;
        while self.pending_out.len() - offset >= self.frame_size {
            emit(&self.pending_out[offset..offset + self.frame_size]);
            offset += self.frame_size;
        }
        self.pending_out.drain(..offset);
    }
}

/// Counters shared between the capture thread and the controller.
#[derive(Debug, Default)]
pub struct CaptureStats {
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl CaptureStats {
    pub fn frames_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Non-blocking handle for pushing encoded frames to the session writer.
///
/// Cloned into the capture callback; never awaits.
#[derive(Debug, Clone)]
pub struct AudioSender {
    tx: mpsc::Sender<WireAudioMessage>,
    stats: Arc<CaptureStats>,
}

impl AudioSender {
    /// Create a sender and the receiving end drained by the session writer.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<WireAudioMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sender = Self {
            tx,
            stats: Arc::new(CaptureStats::default()),
        };
        (sender, rx)
    }

    /// Queue a frame. Returns false when it was dropped.
    pub fn send(&self, message: WireAudioMessage) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 100 == 0 {
                    warn!(dropped, "Outbound audio queue full, dropping frames");
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn stats(&self) -> Arc<CaptureStats> {
        self.stats.clone()
    }
}

/// The per-frame work done on the audio thread: encode, then forward.
pub fn frame_forwarder(sender: AudioSender) -> FrameCallback {
    Box::new(move |frame: &[f32]| {
        sender.send(codec::encode(frame));
    })
}

/// Wire a microphone stream to the session.
pub fn attach(
    microphone: &mut dyn MediaStream,
    frame_size: usize,
    sender: AudioSender,
) -> VoiceResult<Box<dyn ProcessorNode>> {
    let node = microphone.connect(frame_size, frame_forwarder(sender))?;
    debug!(frame_size, "Capture pipeline connected");
    Ok(node)
}

/// Classify a microphone acquisition failure by its message.
///
/// Platform audio layers report permission problems only as text, so this
/// looks for the usual wording.
pub fn classify_microphone_error(message: &str) -> VoiceError {
    let lower = message.to_lowercase();
    if lower.contains("permission")
        || lower.contains("access")
        || lower.contains("denied")
        || lower.contains("notallowed")
    {
        VoiceError::Permission(message.to_string())
    } else if lower.contains("no default input")
        || lower.contains("not found")
        || lower.contains("notfound")
        || lower.contains("not available")
        || lower.contains("no microphone")
    {
        VoiceError::Device(message.to_string())
    } else {
        VoiceError::Audio(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{FRAME_SIZE, INPUT_SAMPLE_RATE};

    #[test]
    fn test_slicer_without_resampling() {
        let mut slicer = FrameSlicer::new(16000, 1, 16000, 4).unwrap();
        let mut frames = Vec::new();

        slicer.push(&[0.1; 10], |frame| frames.push(frame.to_vec()));
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == 4));

        // The two leftover samples complete the next frame
        slicer.push(&[0.1; 2], |frame| frames.push(frame.to_vec()));
        assert_eq!(frames.len(), 3);
    }

    #[test]
    fn test_slicer_keeps_sample_order_across_pushes() {
        let mut slicer = FrameSlicer::new(16000, 1, 16000, 2).unwrap();
        let mut frames = Vec::new();

        slicer.push(&[1.0, 2.0, 3.0, 4.0, 5.0], |frame| frames.push(frame.to_vec()));
        slicer.push(&[6.0], |frame| frames.push(frame.to_vec()));
        assert_eq!(frames, vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]]);
    }

    #[test]
    fn test_slicer_mixes_down_to_mono() {
        let mut slicer = FrameSlicer::new(16000, 2, 16000, 2).unwrap();
        let mut frames = Vec::new();

        slicer.push(&[1.0, 0.0, 0.5, 0.5], |frame| frames.push(frame.to_vec()));
        assert_eq!(frames, vec![vec![0.5, 0.5]]);
    }

    #[test]
    fn test_slicer_resamples_to_wire_rate() {
        let mut slicer = FrameSlicer::new(48000, 1, INPUT_SAMPLE_RATE, FRAME_SIZE).unwrap();
        let mut frames = 0;

        // One second at 48kHz is just under 16000 wire samples after chunking
        slicer.push(&vec![0.0; 48000], |frame| {
            assert_eq!(frame.len(), FRAME_SIZE);
            frames += 1;
        });
        assert_eq!(frames, 3);
    }

    #[tokio::test]
    async fn test_sender_drops_when_full() {
        let (sender, mut rx) = AudioSender::channel(2);
        let mut forward = frame_forwarder(sender.clone());

        for _ in 0..5 {
            forward(&[0.0; 8]);
        }

        let stats = sender.stats();
        assert_eq!(stats.frames_sent(), 2);
        assert_eq!(stats.frames_dropped(), 3);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.mime_type, "audio/pcm;rate=16000");
    }

    #[test]
    fn test_microphone_error_classification() {
        assert!(matches!(
            classify_microphone_error("Permission denied by the system"),
            VoiceError::Permission(_)
        ));
        assert!(matches!(
            classify_microphone_error("No default input device"),
            VoiceError::Device(_)
        ));
        assert!(matches!(
            classify_microphone_error("stream config not supported"),
            VoiceError::Audio(_)
        ));
    }
}
