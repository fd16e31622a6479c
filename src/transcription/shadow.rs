//! Recognizer seam and caption tracking.

use crate::error::VoiceResult;
use tracing::debug;

/// A recognition result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEvent {
    /// Partial text for the utterance in progress
    Interim(String),
    /// The utterance is finished
    Final(String),
}

/// Where a recognizer delivers its results. Called from the recognizer's thread.
pub type TranscriptSink = Box<dyn FnMut(TranscriptEvent) + Send>;

/// A local speech recognizer that shadows the microphone.
///
/// ## Contract:
/// - `start` may fail; the session continues without captions
/// - `stop` is called on every teardown and must tolerate being called when
///   the recognizer never started
pub trait TranscriptionShadow {
    fn start(&mut self, sink: TranscriptSink) -> VoiceResult<()>;
    fn stop(&mut self);
}

/// Used when the platform has no recognizer.
#[derive(Debug, Default)]
pub struct NoShadow;

impl TranscriptionShadow for NoShadow {
    fn start(&mut self, _sink: TranscriptSink) -> VoiceResult<()> {
        debug!("No local recognizer available, captions disabled");
        Ok(())
    }

    fn stop(&mut self) {}
}

/// The caption currently shown.
///
/// Only interim text is displayed; a final result clears it because the
/// model's spoken reply takes over from there.
#[derive(Debug, Default, Clone)]
pub struct Caption {
    interim: Option<String>,
}

impl Caption {
    pub fn apply(&mut self, event: TranscriptEvent) {
        match event {
            TranscriptEvent::Interim(text) if !text.trim().is_empty() => {
                self.interim = Some(text);
            }
            TranscriptEvent::Interim(_) | TranscriptEvent::Final(_) => {
                self.interim = None;
            }
        }
    }

    pub fn clear(&mut self) {
        self.interim = None;
    }

    pub fn text(&self) -> Option<&str> {
        self.interim.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caption_shows_only_interim_text() {
        let mut caption = Caption::default();
        caption.apply(TranscriptEvent::Interim("what's on".to_string()));
        assert_eq!(caption.text(), Some("what's on"));

        caption.apply(TranscriptEvent::Interim("what's on my plan".to_string()));
        assert_eq!(caption.text(), Some("what's on my plan"));

        caption.apply(TranscriptEvent::Final("what's on my plan today".to_string()));
        assert_eq!(caption.text(), None);
    }

    #[test]
    fn test_blank_interim_clears() {
        let mut caption = Caption::default();
        caption.apply(TranscriptEvent::Interim("hello".to_string()));
        caption.apply(TranscriptEvent::Interim("   ".to_string()));
        assert_eq!(caption.text(), None);
    }

    #[test]
    fn test_no_shadow_is_harmless() {
        let mut shadow = NoShadow;
        assert!(shadow.start(Box::new(|_| {})).is_ok());
        shadow.stop();
        shadow.stop();
    }
}
