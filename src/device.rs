//! # Audio Device Backend
//!
//! The cpal implementation of the audio seams in `crate::audio`: default input
//! and output devices, microphone streams and an output timeline driven by the
//! device callback.
//!
//! ## Threading:
//! - cpal callbacks run on their own audio threads
//! - The microphone callback pushes into a [`FrameSlicer`] behind a mutex that
//!   the controller only locks to attach or detach the processor
//! - The output callback renders from a shared [`Timeline`] with `try_lock` so
//!   the audio thread never blocks; a contended block plays silence

use crate::audio::capture::{classify_microphone_error, FrameSlicer};
use crate::audio::playback::Timeline;
use crate::audio::{
    AudioBackend, AudioContext, BufferId, EndedCallback, FrameCallback, MediaStream, OutputContext,
    PlaybackBuffer, ProcessorNode,
};
use crate::error::{VoiceError, VoiceResult};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Host, SampleFormat, Stream, StreamConfig, SupportedStreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Lock a mutex on the controller thread, recovering from a poisoned audio thread.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Audio backend using the platform's default cpal host.
pub struct CpalBackend {
    host: Host,
}

impl CpalBackend {
    pub fn new() -> Self {
        let host = cpal::default_host();
        info!("Using audio host: {:?}", host.id());
        Self { host }
    }

    /// Pick an output config running at `wanted` Hz if the device supports it,
    /// otherwise the device default.
    fn output_config(device: &Device, wanted: u32) -> VoiceResult<SupportedStreamConfig> {
        if let Ok(ranges) = device.supported_output_configs() {
            for range in ranges {
                if range.min_sample_rate().0 <= wanted && range.max_sample_rate().0 >= wanted {
                    return Ok(range.with_sample_rate(cpal::SampleRate(wanted)));
                }
            }
        }
        device
            .default_output_config()
            .map_err(|e| VoiceError::Audio(format!("Failed to get output config: {e}")))
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for CpalBackend {
    fn open_input(&mut self, sample_rate: u32) -> VoiceResult<Box<dyn AudioContext>> {
        debug!(sample_rate, "Input context opened");
        Ok(Box::new(CpalInputContext { closed: false }))
    }

    fn open_output(
        &mut self,
        sample_rate: u32,
        on_ended: EndedCallback,
    ) -> VoiceResult<Box<dyn OutputContext>> {
        let device = self
            .host
            .default_output_device()
            .ok_or_else(|| VoiceError::Audio("No default output device".to_string()))?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".into());

        let supported = Self::output_config(&device, sample_rate)?;
        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();
        let device_rate = config.sample_rate.0;
        let channels = config.channels as usize;

        let timeline = Arc::new(Mutex::new(Timeline::new(device_rate)));
        let running = Arc::new(AtomicBool::new(true));

        let stream = match sample_format {
            SampleFormat::F32 => build_output_stream::<f32>(&device, &config, timeline.clone(), running.clone(), channels, on_ended)?,
            SampleFormat::I16 => build_output_stream::<i16>(&device, &config, timeline.clone(), running.clone(), channels, on_ended)?,
            SampleFormat::U16 => build_output_stream::<u16>(&device, &config, timeline.clone(), running.clone(), channels, on_ended)?,
            SampleFormat::I32 => build_output_stream::<i32>(&device, &config, timeline.clone(), running.clone(), channels, on_ended)?,
            other => {
                return Err(VoiceError::Audio(format!("Unsupported sample format: {:?}", other)));
            }
        };

        stream
            .play()
            .map_err(|e| VoiceError::Audio(format!("Failed to start output stream: {e}")))?;

        info!(
            "Audio output opened on {} ({} Hz, {} channels, wire rate {} Hz)",
            device_name, device_rate, channels, sample_rate
        );
        Ok(Box::new(CpalOutputContext {
            stream: Some(stream),
            timeline,
            running,
        }))
    }

    fn request_microphone(&mut self, sample_rate: u32) -> VoiceResult<Box<dyn MediaStream>> {
        let device = self
            .host
            .default_input_device()
            .ok_or_else(|| VoiceError::Device("No default input device".to_string()))?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".into());

        let supported = device
            .default_input_config()
            .map_err(|e| classify_microphone_error(&e.to_string()))?;
        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();

        let sink: Arc<Mutex<Option<FrameSink>>> = Arc::new(Mutex::new(None));

        let stream = match sample_format {
            SampleFormat::F32 => build_input_stream::<f32>(&device, &config, sink.clone())?,
            SampleFormat::I16 => build_input_stream::<i16>(&device, &config, sink.clone())?,
            SampleFormat::U16 => build_input_stream::<u16>(&device, &config, sink.clone())?,
            SampleFormat::I32 => build_input_stream::<i32>(&device, &config, sink.clone())?,
            other => {
                return Err(VoiceError::Audio(format!("Unsupported sample format: {:?}", other)));
            }
        };

        stream
            .play()
            .map_err(|e| classify_microphone_error(&e.to_string()))?;

        info!(
            "Microphone opened on {} ({} Hz, {} channels)",
            device_name, config.sample_rate.0, config.channels
        );
        Ok(Box::new(CpalMicrophone {
            stream: Some(stream),
            sink,
            device_rate: config.sample_rate.0,
            channels: config.channels as usize,
            wire_rate: sample_rate,
        }))
    }
}

/// Capture-side context. cpal has no separate context object; this only tracks
/// the open/closed state so teardown can account for it.
struct CpalInputContext {
    closed: bool,
}

impl AudioContext for CpalInputContext {
    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            debug!("Input context closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// What the microphone callback feeds while a processor is connected.
struct FrameSink {
    slicer: FrameSlicer,
    on_frame: FrameCallback,
}

struct CpalMicrophone {
    stream: Option<Stream>,
    sink: Arc<Mutex<Option<FrameSink>>>,
    device_rate: u32,
    channels: usize,
    wire_rate: u32,
}

impl MediaStream for CpalMicrophone {
    fn connect(
        &mut self,
        frame_size: usize,
        on_frame: FrameCallback,
    ) -> VoiceResult<Box<dyn ProcessorNode>> {
        if self.stream.is_none() {
            return Err(VoiceError::Audio("microphone already stopped".to_string()));
        }
        let slicer = FrameSlicer::new(self.device_rate, self.channels, self.wire_rate, frame_size)?;
        *lock(&self.sink) = Some(FrameSink { slicer, on_frame });
        Ok(Box::new(CpalProcessorNode {
            sink: self.sink.clone(),
        }))
    }

    fn set_enabled(&mut self, enabled: bool) -> VoiceResult<()> {
        let Some(stream) = self.stream.as_ref() else {
            return Ok(());
        };
        if enabled {
            stream
                .play()
                .map_err(|e| VoiceError::Audio(format!("Failed to resume microphone: {e}")))
        } else {
            stream
                .pause()
                .map_err(|e| VoiceError::Audio(format!("Failed to pause microphone: {e}")))
        }
    }

    fn stop_tracks(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                debug!("Pausing microphone during stop failed: {e}");
            }
            drop(stream);
            debug!("Microphone stopped");
        }
        lock(&self.sink).take();
    }
}

struct CpalProcessorNode {
    sink: Arc<Mutex<Option<FrameSink>>>,
}

impl ProcessorNode for CpalProcessorNode {
    fn disconnect(&mut self) {
        lock(&self.sink).take();
    }
}

struct CpalOutputContext {
    stream: Option<Stream>,
    timeline: Arc<Mutex<Timeline>>,
    running: Arc<AtomicBool>,
}

impl OutputContext for CpalOutputContext {
    fn current_time(&self) -> f64 {
        lock(&self.timeline).current_time()
    }

    fn start_buffer(&mut self, id: BufferId, buffer: PlaybackBuffer, at: f64) -> VoiceResult<()> {
        if self.stream.is_none() {
            return Err(VoiceError::Audio("output context is closed".to_string()));
        }
        lock(&self.timeline).schedule(id, buffer, at);
        Ok(())
    }

    fn stop_buffer(&mut self, id: BufferId) {
        lock(&self.timeline).stop(id);
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if self.stream.take().is_some() {
            lock(&self.timeline).clear();
            debug!("Output context closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.stream.is_none()
    }
}

fn build_input_stream<T>(
    device: &Device,
    config: &StreamConfig,
    sink: Arc<Mutex<Option<FrameSink>>>,
) -> VoiceResult<Stream>
where
    T: cpal::Sample + cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let mut samples: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                // Busy means the controller is attaching/detaching; skip this block
                let Ok(mut guard) = sink.try_lock() else {
                    return;
                };
                let Some(FrameSink { slicer, on_frame }) = guard.as_mut() else {
                    return;
                };
                samples.clear();
                samples.extend(data.iter().map(|s| <f32 as cpal::Sample>::from_sample(*s)));
                slicer.push(&samples, |frame| on_frame(frame));
            },
            move |err| {
                error!("Audio capture error: {err}");
            },
            None,
        )
        .map_err(|e| classify_microphone_error(&e.to_string()))
}

fn build_output_stream<T>(
    device: &Device,
    config: &StreamConfig,
    timeline: Arc<Mutex<Timeline>>,
    running: Arc<AtomicBool>,
    channels: usize,
    mut on_ended: EndedCallback,
) -> VoiceResult<Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    let mut scratch: Vec<f32> = Vec::new();
    let mut ended: Vec<BufferId> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                if !running.load(Ordering::Relaxed) {
                    for sample in data.iter_mut() {
                        *sample = T::EQUILIBRIUM;
                    }
                    return;
                }

                scratch.resize(data.len(), 0.0);
                ended.clear();
                match timeline.try_lock() {
                    Ok(mut timeline) => ended.extend_from_slice(timeline.render(&mut scratch, channels)),
                    Err(_) => scratch.iter_mut().for_each(|s| *s = 0.0),
                }

                for (out, sample) in data.iter_mut().zip(scratch.iter()) {
                    *out = T::from_sample(*sample);
                }
                for &id in &ended {
                    on_ended(id);
                }
            },
            move |err| {
                warn!("Audio playback error: {err}");
            },
            None,
        )
        .map_err(|e| VoiceError::Audio(format!("Failed to build output stream: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_context_close_is_idempotent() {
        let mut context = CpalInputContext { closed: false };
        assert!(!context.is_closed());
        context.close();
        context.close();
        assert!(context.is_closed());
    }

    #[test]
    fn test_lock_recovers_from_poison() {
        let mutex = Arc::new(Mutex::new(Timeline::new(10)));
        let poisoner = mutex.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("audio thread died");
        })
        .join();

        assert!(mutex.is_poisoned());
        assert_eq!(lock(&mutex).current_time(), 0.0);
    }
}
