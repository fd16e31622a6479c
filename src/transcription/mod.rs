//! # Transcription Module
//!
//! An optional, best-effort captioning pass that runs alongside a live voice
//! session and shows what the user is saying while they say it.
//!
//! ## Key Components:
//! - **TranscriptionShadow**: The platform recognizer seam (`start(sink)` / `stop()`)
//! - **TranscriptEvent**: Interim and final results delivered through the session queue
//! - **Caption**: Tracks the interim text currently on screen
//!
//! ## Failure Policy:
//! Nothing in here can end a session. A recognizer that fails to start is
//! logged and ignored; platforms without one use [`NoShadow`].

pub mod shadow;      // Recognizer seam and caption state

pub use shadow::{Caption, NoShadow, TranscriptEvent, TranscriptSink, TranscriptionShadow};
