//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Special-case environment variables (`VOICE`, `LIVE_MODEL`)
//! 2. Environment variables (APP_LIVE_VOICE, APP_AUDIO_FRAME_SIZE, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! The API key is deliberately not part of [`AppConfig`]: it is read by
//! [`Credentials::from_env`] so that it never ends up in serialized config or logs.

use crate::websocket::Voice;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Environment variable holding the API key.
pub const API_KEY_VAR: &str = "API_KEY";

/// Main application configuration that contains all settings.
///
/// ## Rust Concepts:
/// - **#[derive(...)]**: `Serialize`/`Deserialize` let the `config` crate merge
///   defaults, files and environment variables into this struct
/// - **nested structs**: Each section maps to a `[section]` table in config.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub live: LiveConfig,
    pub audio: AudioConfig,
    pub speech: SpeechConfig,
}

/// Live (bidirectional streaming) session settings.
///
/// ## Fields:
/// - `endpoint`: WebSocket URL of the live-conversation endpoint
/// - `model`: Model resource name sent in the setup message
/// - `voice`: One of the prebuilt voices ("Kore", "Puck", "Charon", "Fenrir", "Zephyr")
/// - `system_instruction`: Persona text sent with the setup message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    pub endpoint: String,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
}

/// Audio pipeline settings.
///
/// ## Fields:
/// - `input_sample_rate`: Rate of captured frames on the wire (16kHz)
/// - `output_sample_rate`: Rate of audio received from the endpoint (24kHz)
/// - `frame_size`: Samples per captured frame
/// - `outbound_queue_frames`: How many encoded frames may wait for the socket
///   before new frames are dropped
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub frame_size: usize,
    pub outbound_queue_frames: usize,
}

/// Read-aloud (text-to-speech) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    pub endpoint: String,
    pub model: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            live: LiveConfig {
                endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
                model: "models/gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
                voice: "Kore".to_string(),
                system_instruction: "You are Aurelia. Professional, futuristic, efficient.".to_string(),
            },
            audio: AudioConfig {
                input_sample_rate: 16000,   // Wire format for microphone audio
                output_sample_rate: 24000,  // Wire format for model audio
                frame_size: 4096,           // ~256ms per captured frame
                outbound_queue_frames: 8,
            },
            speech: SpeechConfig {
                endpoint: "https://generativelanguage.googleapis.com/v1beta/models".to_string(),
                model: "gemini-2.5-flash-preview-tts".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_LIVE_VOICE=Puck`: Override the voice
    /// - `APP_AUDIO_FRAME_SIZE=2048`: Override the capture frame size
    /// - `VOICE=Zephyr`: Short form of the voice override
    /// - `LIVE_MODEL=models/...`: Short form of the model override
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        if let Ok(voice) = env::var("VOICE") {
            settings = settings.set_override("live.voice", voice)?;
        }

        if let Ok(model) = env::var("LIVE_MODEL") {
            settings = settings.set_override("live.model", model)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Sample rates and frame size are non-zero
    /// - The outbound queue can hold at least one frame
    /// - The voice is one of the prebuilt voices
    /// - The live endpoint is a WebSocket URL
    pub fn validate(&self) -> Result<()> {
        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.frame_size == 0 {
            return Err(anyhow::anyhow!("Frame size must be greater than 0"));
        }

        if self.audio.outbound_queue_frames == 0 {
            return Err(anyhow::anyhow!("Outbound queue must hold at least one frame"));
        }

        self.voice()?;

        if !(self.live.endpoint.starts_with("wss://") || self.live.endpoint.starts_with("ws://")) {
            return Err(anyhow::anyhow!(
                "Live endpoint must be a ws:// or wss:// URL, got {}",
                self.live.endpoint
            ));
        }

        Ok(())
    }

    /// The configured voice as a typed value.
    pub fn voice(&self) -> Result<Voice> {
        self.live.voice.parse()
    }

    /// Update configuration from a JSON string (used for runtime changes such as
    /// switching voice between sessions).
    ///
    /// Only the fields present in the JSON are changed, e.g.
    /// `{"live": {"voice": "Puck"}}` changes only the voice.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(live) = partial_config.get("live") {
            if let Some(voice) = live.get("voice").and_then(|v| v.as_str()) {
                self.live.voice = voice.to_string();
            }
            if let Some(model) = live.get("model").and_then(|v| v.as_str()) {
                self.live.model = model.to_string();
            }
            if let Some(instruction) = live.get("system_instruction").and_then(|v| v.as_str()) {
                self.live.system_instruction = instruction.to_string();
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(frame_size) = audio.get("frame_size").and_then(|v| v.as_u64()) {
                self.audio.frame_size = frame_size as usize;
            }
            if let Some(queue) = audio.get("outbound_queue_frames").and_then(|v| v.as_u64()) {
                self.audio.outbound_queue_frames = queue as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}

/// The credential used to authenticate with the hosted endpoints.
///
/// `Debug` is implemented by hand so the key never reaches a log line.
#[derive(Clone, Default)]
pub struct Credentials {
    api_key: Option<String>,
}

impl Credentials {
    /// Read the API key from the environment (after `.env` has been loaded).
    /// Empty values count as missing.
    pub fn from_env() -> Self {
        let api_key = env::var(API_KEY_VAR).ok().filter(|key| !key.trim().is_empty());
        Self { api_key }
    }

    /// Credentials with an explicit key.
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            api_key: Some(key.into()),
        }
    }

    /// No credential configured.
    pub fn missing() -> Self {
        Self::default()
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key.as_ref().map(|_| "***SET***"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.audio.input_sample_rate, 16000);
        assert_eq!(config.audio.output_sample_rate, 24000);
        assert_eq!(config.audio.frame_size, 4096);
        assert_eq!(config.voice().unwrap(), Voice::Kore);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.audio.frame_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.live.voice = "Nobody".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.live.endpoint = "https://example.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"live": {"voice": "Puck"}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.voice().unwrap(), Voice::Puck);
        // Other fields should remain unchanged
        assert_eq!(config.audio.frame_size, 4096);

        // Invalid updates are rejected by validation
        let json = r#"{"live": {"voice": "Nobody"}}"#;
        assert!(config.update_from_json(json).is_err());
    }

    #[test]
    fn test_credentials_debug_hides_key() {
        let creds = Credentials::with_key("secret-key");
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("secret-key"));
        assert!(creds.is_configured());
        assert!(!Credentials::missing().is_configured());
    }
}
