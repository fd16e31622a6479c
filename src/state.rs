//! # Voice Status
//!
//! A read-only snapshot of the session controller for display: what the
//! assistant avatar should show, the microphone indicator, the live caption
//! and per-session counters.
//!
//! ## Presence rules (first match wins):
//! 1. Read-aloud speech being generated → `Thinking`
//! 2. Buffers playing → `Speaking`
//! 3. Session in error, idle or closed → `Idle`
//! 4. Connecting → `Thinking`
//! 5. Interim caption on screen → `Thinking`
//! 6. Muted → `Idle`
//! 7. Otherwise → `Listening`

use crate::audio::session::SessionState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// What the assistant is doing, as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Idle,
    Listening,
    Thinking,
    Speaking,
}

impl Presence {
    /// Derive the presence from the controller's state.
    pub fn derive(
        state: SessionState,
        muted: bool,
        playing: bool,
        has_caption: bool,
        generating: bool,
    ) -> Self {
        if generating {
            return Presence::Thinking;
        }
        if playing {
            return Presence::Speaking;
        }
        match state {
            SessionState::Idle | SessionState::Error | SessionState::Closed => Presence::Idle,
            SessionState::Connecting => Presence::Thinking,
            SessionState::Connected if has_caption => Presence::Thinking,
            SessionState::Connected if muted => Presence::Idle,
            SessionState::Connected => Presence::Listening,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Presence::Idle => "idle",
            Presence::Listening => "listening",
            Presence::Thinking => "thinking",
            Presence::Speaking => "speaking",
        }
    }
}

/// Microphone indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MicIndicator {
    /// The last error was a permission denial
    AccessDenied,
    Muted,
    Active,
}

impl MicIndicator {
    pub fn as_str(&self) -> &str {
        match self {
            MicIndicator::AccessDenied => "access_denied",
            MicIndicator::Muted => "muted",
            MicIndicator::Active => "active",
        }
    }
}

/// Counters for one session.
///
/// ## Rust Concepts:
/// - **Uuid**: Random id so log lines from one session can be grouped
/// - **DateTime<Utc>**: Wall-clock start time (chrono)
#[derive(Debug, Clone, Serialize)]
pub struct SessionMetrics {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub buffers_scheduled: u64,
    pub interruptions: u64,
    pub decode_errors: u64,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            started_at: Utc::now(),
            frames_sent: 0,
            frames_dropped: 0,
            buffers_scheduled: 0,
            interruptions: 0,
            decode_errors: 0,
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        (Utc::now() - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    /// Share of captured frames that were dropped (0.0 - 1.0).
    pub fn drop_rate(&self) -> f64 {
        let total = self.frames_sent + self.frames_dropped;
        if total == 0 {
            0.0
        } else {
            self.frames_dropped as f64 / total as f64
        }
    }
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of the controller for display.
#[derive(Debug, Clone, Serialize)]
pub struct VoiceStatus {
    pub state: SessionState,
    pub presence: Presence,
    pub mic: MicIndicator,
    pub caption: Option<String>,
    /// User-facing message of the last error, kept until restart or dismissal
    pub error: Option<String>,
    pub read_aloud_playing: bool,
    pub generating_speech: bool,
    pub metrics: SessionMetrics,
}

impl VoiceStatus {
    /// One-line summary for the terminal.
    pub fn summary(&self) -> String {
        let mut line = format!(
            "[{}] {} | mic {} | sent {} dropped {} ({:.1}%) | played {} interrupted {}",
            self.state.as_str(),
            self.presence.as_str(),
            self.mic.as_str(),
            self.metrics.frames_sent,
            self.metrics.frames_dropped,
            self.metrics.drop_rate() * 100.0,
            self.metrics.buffers_scheduled,
            self.metrics.interruptions,
        );
        if self.generating_speech {
            line.push_str(" | generating speech");
        } else if self.read_aloud_playing {
            line.push_str(" | reading aloud");
        }
        if let Some(caption) = &self.caption {
            line.push_str(&format!(" | \"{}\"", caption));
        }
        if let Some(error) = &self.error {
            line.push_str(&format!(" | {}", error));
        }
        line
    }
}
