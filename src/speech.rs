//! # Read-Aloud
//!
//! Turns a piece of text into speech with the content-generation endpoint
//! (audio response modality, one of the prebuilt voices) and hands back a
//! playback buffer. The caller plays it through the session controller's
//! read-aloud output.
//!
//! Failures are reported to the caller and never affect a live session.

use crate::audio::codec;
use crate::audio::{PlaybackBuffer, OUTPUT_SAMPLE_RATE};
use crate::config::{Credentials, SpeechConfig as SpeechSettings};
use crate::error::{TransportErrorKind, VoiceError, VoiceResult};
use crate::websocket::{SpeechConfig, TextPart, Voice};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateSpeechRequest {
    contents: Vec<RequestContent>,
    generation_config: SpeechGenerationConfig,
}

#[derive(Debug, Serialize)]
struct RequestContent {
    parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechGenerationConfig {
    response_modalities: Vec<String>,
    speech_config: SpeechConfig,
}

#[derive(Debug, Default, Deserialize)]
struct GenerateSpeechResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CandidatePart {
    inline_data: Option<CandidateInlineData>,
}

#[derive(Debug, Deserialize)]
struct CandidateInlineData {
    data: String,
}

impl GenerateSpeechRequest {
    fn new(text: &str, voice: Voice) -> Self {
        Self {
            contents: vec![RequestContent {
                parts: vec![TextPart {
                    text: text.to_string(),
                }],
            }],
            generation_config: SpeechGenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig::for_voice(voice),
            },
        }
    }
}

impl GenerateSpeechResponse {
    /// Base64 PCM of the first candidate.
    fn audio(&self) -> Option<&str> {
        self.candidates
            .first()?
            .content
            .as_ref()?
            .parts
            .iter()
            .find_map(|part| part.inline_data.as_ref())
            .map(|inline| inline.data.as_str())
    }
}

/// Client for the text-to-speech call.
pub struct SpeechClient {
    client: reqwest::Client,
    settings: SpeechSettings,
    credentials: Credentials,
}

impl SpeechClient {
    pub fn new(settings: SpeechSettings, credentials: Credentials) -> Self {
        Self {
            client: reqwest::Client::new(),
            settings,
            credentials,
        }
    }

    fn url(&self, api_key: &str) -> VoiceResult<Url> {
        let base = format!(
            "{}/{}:generateContent",
            self.settings.endpoint.trim_end_matches('/'),
            self.settings.model
        );
        let mut url = Url::parse(&base)
            .map_err(|e| VoiceError::Config(format!("Invalid speech endpoint {}: {}", base, e)))?;
        url.query_pairs_mut().append_pair("key", api_key);
        Ok(url)
    }

    /// Synthesize `text` and return base64 24kHz PCM.
    pub async fn synthesize(&self, text: &str, voice: Voice) -> VoiceResult<String> {
        let api_key = self
            .credentials
            .api_key()
            .ok_or_else(|| VoiceError::Config("API Key missing from environment.".to_string()))?;

        if text.trim().is_empty() {
            return Err(VoiceError::Config("Nothing to read aloud".to_string()));
        }

        debug!(chars = text.len(), voice = %voice, "Requesting speech");
        let response = self
            .client
            .post(self.url(api_key)?)
            .json(&GenerateSpeechRequest::new(text, voice))
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(VoiceError::Transport {
                kind: TransportErrorKind::from_status(status.as_u16()),
                detail: format!("speech request failed with status {}", status),
            });
        }

        let body: GenerateSpeechResponse = response.json().await.map_err(classify_request_error)?;
        body.audio()
            .map(str::to_string)
            .ok_or_else(|| VoiceError::Decode("speech response carried no audio".to_string()))
    }

    /// Synthesize `text` and decode it for playback.
    pub async fn read_aloud(&self, text: &str, voice: Voice) -> VoiceResult<PlaybackBuffer> {
        let data = self.synthesize(text, voice).await?;
        let buffer = codec::decode(&data, OUTPUT_SAMPLE_RATE)?;
        info!(seconds = buffer.duration(), "Speech ready");
        Ok(buffer)
    }
}

fn classify_request_error(err: reqwest::Error) -> VoiceError {
    if let Some(status) = err.status() {
        return VoiceError::Transport {
            kind: TransportErrorKind::from_status(status.as_u16()),
            detail: err.to_string(),
        };
    }
    if err.is_connect() || err.is_timeout() {
        return VoiceError::Transport {
            kind: TransportErrorKind::NetworkUnreachable,
            detail: err.to_string(),
        };
    }
    VoiceError::transport(err.to_string())
}
