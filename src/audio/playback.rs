//! # Playback Scheduling
//!
//! Inbound audio arrives in small chunks. To play them without gaps or
//! overlaps, every chunk is scheduled on the output context's clock directly
//! after the previous one.
//!
//! ## Scheduling rule:
//! ```text
//! start           = max(now, next_start_time)
//! next_start_time = start + duration
//! ```
//!
//! ## Interruption:
//! When the user barges in, the endpoint sends `interrupted`. `flush()` stops
//! every buffer still playing or queued and resets the cursor, so the next
//! reply starts immediately.
//!
//! [`Timeline`] is the sample-level mixer that an output device renders from.
//! It keeps the same clock the scheduler reads through `OutputContext::current_time`.

use crate::audio::{BufferId, OutputContext, PlaybackBuffer};
use crate::error::VoiceResult;
use std::collections::HashSet;
use tracing::debug;

/// Where a buffer landed on the output timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledPlayback {
    pub id: BufferId,
    pub start: f64,
    pub end: f64,
}

/// Gapless scheduler for one output context.
///
/// ## State:
/// - `next_start_time`: where the next buffer will start (context seconds)
/// - `active`: buffers started and not yet ended or stopped
#[derive(Debug, Default)]
pub struct PlaybackScheduler {
    next_start_time: f64,
    active: HashSet<BufferId>,
    next_id: BufferId,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `buffer` right after whatever is already queued.
    pub fn enqueue(
        &mut self,
        output: &mut dyn OutputContext,
        buffer: PlaybackBuffer,
    ) -> VoiceResult<ScheduledPlayback> {
        let now = output.current_time();
        let start = now.max(self.next_start_time);
        let end = start + buffer.duration();

        let id = self.next_id;
        self.next_id += 1;

        output.start_buffer(id, buffer, start)?;
        self.active.insert(id);
        self.next_start_time = end;

        debug!(buffer_id = id, start, end, "Scheduled playback buffer");
        Ok(ScheduledPlayback { id, start, end })
    }

    /// Completion callback for a buffer. Returns whether it was still active.
    pub fn on_ended(&mut self, id: BufferId) -> bool {
        self.active.remove(&id)
    }

    /// Stop everything that is playing or queued and reset the cursor.
    ///
    /// Returns how many buffers were stopped.
    pub fn flush(&mut self, output: &mut dyn OutputContext) -> usize {
        let stopped = self.active.len();
        for id in self.active.drain() {
            output.stop_buffer(id);
        }
        self.next_start_time = 0.0;
        stopped
    }

    /// Forget every active buffer without touching an output context
    /// (used when the context is already gone).
    pub fn reset(&mut self) {
        self.active.clear();
        self.next_start_time = 0.0;
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_playing(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }
}

/// A buffer placed on the timeline.
#[derive(Debug)]
struct TimelineEntry {
    id: BufferId,
    samples: Vec<f32>,
    sample_rate: u32,
    start: f64,
}

impl TimelineEntry {
    fn end(&self) -> f64 {
        self.start + self.samples.len() as f64 / self.sample_rate.max(1) as f64
    }

    /// Linearly interpolated sample at timeline time `t`, if the entry covers it.
    fn sample_at(&self, t: f64) -> Option<f32> {
        if t < self.start {
            return None;
        }
        let position = (t - self.start) * self.sample_rate as f64;
        let index = position.floor() as usize;
        if index >= self.samples.len() {
            return None;
        }
        let frac = (position - index as f64) as f32;
        let current = self.samples[index];
        let next = self.samples.get(index + 1).copied().unwrap_or(current);
        Some(current + (next - current) * frac)
    }
}

/// Sample-accurate output timeline.
///
/// The clock is the number of device frames rendered so far, so
/// `current_time()` advances only as audio is actually pulled by the device.
/// Buffers at any sample rate are mixed in at the device rate.
#[derive(Debug)]
pub struct Timeline {
    device_rate: u32,
    frames_rendered: u64,
    entries: Vec<TimelineEntry>,
    /// Reused across `render` calls so the device thread does not allocate
    finished: Vec<BufferId>,
}

impl Timeline {
    pub fn new(device_rate: u32) -> Self {
        Self {
            device_rate: device_rate.max(1),
            frames_rendered: 0,
            entries: Vec::new(),
            finished: Vec::new(),
        }
    }

    pub fn current_time(&self) -> f64 {
        self.frames_rendered as f64 / self.device_rate as f64
    }

    pub fn schedule(&mut self, id: BufferId, buffer: PlaybackBuffer, start: f64) {
        self.entries.push(TimelineEntry {
            id,
            samples: buffer.samples,
            sample_rate: buffer.sample_rate,
            start,
        });
    }

    /// Remove a buffer. Returns false when it already finished or never existed.
    pub fn stop(&mut self, id: BufferId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        self.entries.len() != before
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    /// Fill an interleaved output block and advance the clock.
    ///
    /// Every channel receives the same (mono) mix. Returns the ids of buffers
    /// that finished during this block; the slice is valid until the next call.
    pub fn render(&mut self, out: &mut [f32], channels: usize) -> &[BufferId] {
        let channels = channels.max(1);
        let frames = out.len() / channels;

        for (frame_index, frame) in out.chunks_mut(channels).enumerate() {
            let t = (self.frames_rendered + frame_index as u64) as f64 / self.device_rate as f64;
            let mixed: f32 = self
                .entries
                .iter()
                .filter_map(|entry| entry.sample_at(t))
                .sum();
            let value = mixed.clamp(-1.0, 1.0);
            for sample in frame.iter_mut() {
                *sample = value;
            }
        }

        self.frames_rendered += frames as u64;
        let now = self.current_time();

        let finished = &mut self.finished;
        finished.clear();
        self.entries.retain(|entry| {
            if entry.end() <= now {
                finished.push(entry.id);
                false
            } else {
                true
            }
        });
        &self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::OUTPUT_SAMPLE_RATE;

    /// Output context whose clock is set by the test.
    #[derive(Default)]
    struct ManualOutput {
        now: f64,
        started: Vec<(BufferId, f64)>,
        stopped: Vec<BufferId>,
    }

    impl OutputContext for ManualOutput {
        fn current_time(&self) -> f64 {
            self.now
        }

        fn start_buffer(&mut self, id: BufferId, _buffer: PlaybackBuffer, at: f64) -> VoiceResult<()> {
            self.started.push((id, at));
            Ok(())
        }

        fn stop_buffer(&mut self, id: BufferId) {
            self.stopped.push(id);
        }

        fn close(&mut self) {}

        fn is_closed(&self) -> bool {
            false
        }
    }

    fn one_second() -> PlaybackBuffer {
        PlaybackBuffer::new(vec![0.1; OUTPUT_SAMPLE_RATE as usize], OUTPUT_SAMPLE_RATE)
    }

    #[test]
    fn test_back_to_back_scheduling() {
        let mut output = ManualOutput::default();
        let mut scheduler = PlaybackScheduler::new();

        let first = scheduler.enqueue(&mut output, one_second()).unwrap();
        let second = scheduler.enqueue(&mut output, one_second()).unwrap();
        let third = scheduler.enqueue(&mut output, one_second()).unwrap();

        assert_eq!(first.start, 0.0);
        assert_eq!(second.start, 1.0);
        assert_eq!(third.start, 2.0);
        assert_eq!(third.end, 3.0);
        assert_eq!(scheduler.active_count(), 3);
    }

    #[test]
    fn test_late_buffer_starts_now() {
        let mut output = ManualOutput::default();
        let mut scheduler = PlaybackScheduler::new();

        scheduler.enqueue(&mut output, one_second()).unwrap();
        output.now = 5.0;
        let late = scheduler.enqueue(&mut output, one_second()).unwrap();

        assert_eq!(late.start, 5.0);
        assert_eq!(scheduler.next_start_time(), 6.0);
    }

    #[test]
    fn test_flush_resets_cursor() {
        let mut output = ManualOutput::default();
        let mut scheduler = PlaybackScheduler::new();

        let first = scheduler.enqueue(&mut output, one_second()).unwrap();
        scheduler.enqueue(&mut output, one_second()).unwrap();
        output.now = 0.5;

        assert_eq!(scheduler.flush(&mut output), 2);
        assert_eq!(scheduler.active_count(), 0);
        assert_eq!(scheduler.next_start_time(), 0.0);
        assert!(output.stopped.contains(&first.id));

        let after = scheduler.enqueue(&mut output, one_second()).unwrap();
        assert_eq!(after.start, 0.5);
    }

    #[test]
    fn test_on_ended_is_idempotent() {
        let mut output = ManualOutput::default();
        let mut scheduler = PlaybackScheduler::new();

        let scheduled = scheduler.enqueue(&mut output, one_second()).unwrap();
        assert!(scheduler.on_ended(scheduled.id));
        assert!(!scheduler.on_ended(scheduled.id));
        assert!(!scheduler.on_ended(999));
        assert!(!scheduler.is_playing());
    }

    #[test]
    fn test_timeline_renders_back_to_back() {
        // 10 Hz device, 10 Hz buffers: one sample per frame keeps the math exact
        let mut timeline = Timeline::new(10);
        timeline.schedule(0, PlaybackBuffer::new(vec![0.25; 10], 10), 0.0);
        timeline.schedule(1, PlaybackBuffer::new(vec![0.5; 10], 10), 1.0);

        let mut block = vec![0.0; 10];
        let finished = timeline.render(&mut block, 1).to_vec();
        assert!(block.iter().all(|&s| s == 0.25));
        assert_eq!(finished, vec![0]);
        assert_eq!(timeline.current_time(), 1.0);

        let mut block = vec![0.0; 20];
        let finished = timeline.render(&mut block, 2).to_vec();
        assert!(block.iter().all(|&s| s == 0.5));
        assert_eq!(finished, vec![1]);
        assert_eq!(timeline.pending(), 0);
    }

    #[test]
    fn test_timeline_stop_and_silence() {
        let mut timeline = Timeline::new(10);
        timeline.schedule(7, PlaybackBuffer::new(vec![0.5; 10], 10), 0.0);
        assert!(timeline.stop(7));
        assert!(!timeline.stop(7));

        let mut block = vec![1.0; 5];
        assert!(timeline.render(&mut block, 1).is_empty());
        assert!(block.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_timeline_reports_each_finish_once() {
        let mut timeline = Timeline::new(10);
        timeline.schedule(3, PlaybackBuffer::new(vec![0.5; 5], 10), 0.0);

        let mut block = vec![0.0; 10];
        assert_eq!(timeline.render(&mut block, 1), &[3]);
        assert!(timeline.render(&mut block, 1).is_empty());
        assert!(block.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_timeline_resamples_to_device_rate() {
        // 5 Hz buffer on a 10 Hz device: each source sample spans two frames
        let mut timeline = Timeline::new(10);
        timeline.schedule(0, PlaybackBuffer::new(vec![0.0, 1.0], 5), 0.0);

        let mut block = vec![0.0; 4];
        timeline.render(&mut block, 1);
        assert_eq!(block[0], 0.0);
        assert!((block[1] - 0.5).abs() < 1e-6);
        assert_eq!(block[2], 1.0);
        assert_eq!(block[3], 1.0);
    }
}
