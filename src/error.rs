//! # Error Handling
//!
//! This module defines the error taxonomy of a voice session and how each
//! error is presented to the user.
//!
//! ## Error Categories:
//! - **Config**: Missing credential or invalid configuration (fatal, no retry)
//! - **Permission**: Microphone access was denied (fatal for this session)
//! - **Device**: No microphone was found (fatal for this session)
//! - **Audio**: Any other microphone or audio device failure (fatal for this session)
//! - **Transport**: The live endpoint failed; carries a [`TransportErrorKind`]
//! - **Decode**: One malformed inbound audio frame (logged and dropped)
//!
//! ## Rust Concepts:
//! - **enum with data**: Each variant carries the detail message for logging
//! - **Display trait**: The user-facing copy shown until the next start/dismissal
//! - **From trait**: Lets `?` convert library errors into `VoiceError`

use std::fmt;

/// Sub-classification of a transport failure.
///
/// ## Classification Sources:
/// - HTTP status of the failed WebSocket upgrade (403/401/429, 502/503/504)
/// - I/O failures while connecting (DNS, refused, reset)
/// - Free-form error text as a last resort
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Credential rejected or quota exhausted
    AccessDenied,
    /// The endpoint is overloaded or temporarily down
    ServiceUnavailable,
    /// The network could not reach the endpoint
    NetworkUnreachable,
    /// Anything else (protocol errors, unexpected server behaviour)
    Unknown,
}

impl TransportErrorKind {
    /// Classify an HTTP status returned by the endpoint.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 | 429 => TransportErrorKind::AccessDenied,
            502 | 503 | 504 => TransportErrorKind::ServiceUnavailable,
            _ => TransportErrorKind::Unknown,
        }
    }

    /// Classify a free-form error message.
    ///
    /// Used when the only thing available is text, e.g. an error reported by
    /// the server inside a close frame or an opaque library error.
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("403") || lower.contains("permission denied") || lower.contains("quota") {
            TransportErrorKind::AccessDenied
        } else if lower.contains("503") || lower.contains("unavailable") || lower.contains("overloaded") {
            TransportErrorKind::ServiceUnavailable
        } else if lower.contains("failed to fetch")
            || lower.contains("dns")
            || lower.contains("connection refused")
            || lower.contains("network")
        {
            TransportErrorKind::NetworkUnreachable
        } else {
            TransportErrorKind::Unknown
        }
    }

    /// Machine-readable name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportErrorKind::AccessDenied => "access_denied",
            TransportErrorKind::ServiceUnavailable => "service_unavailable",
            TransportErrorKind::NetworkUnreachable => "network_unreachable",
            TransportErrorKind::Unknown => "unknown",
        }
    }
}

/// Errors produced by the voice subsystem.
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(VoiceError::Config("API Key missing from environment.".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceError {
    /// Missing credential or invalid configuration
    Config(String),

    /// The user declined microphone access
    Permission(String),

    /// No microphone found
    Device(String),

    /// An audio device exists but could not be opened or driven
    Audio(String),

    /// The live endpoint failed
    Transport {
        kind: TransportErrorKind,
        detail: String,
    },

    /// One inbound audio frame could not be decoded
    Decode(String),
}

impl VoiceError {
    /// Build a transport error, classifying it from its message.
    pub fn transport(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        VoiceError::Transport {
            kind: TransportErrorKind::from_message(&detail),
            detail,
        }
    }

    /// Machine-readable error type.
    pub fn kind(&self) -> &'static str {
        match self {
            VoiceError::Config(_) => "config_error",
            VoiceError::Permission(_) => "permission_error",
            VoiceError::Device(_) => "device_error",
            VoiceError::Audio(_) => "audio_error",
            VoiceError::Transport { .. } => "transport_error",
            VoiceError::Decode(_) => "decode_error",
        }
    }

    /// Whether this error ends the session it occurred in.
    ///
    /// Decode errors only drop the offending frame.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, VoiceError::Decode(_))
    }

    /// Technical detail for logs (the `Display` output is the user-facing copy).
    pub fn detail(&self) -> &str {
        match self {
            VoiceError::Config(msg)
            | VoiceError::Permission(msg)
            | VoiceError::Device(msg)
            | VoiceError::Audio(msg)
            | VoiceError::Decode(msg) => msg,
            VoiceError::Transport { detail, .. } => detail,
        }
    }
}

/// User-facing messages.
///
/// These are what stays on screen until the user retries or dismisses the error.
impl fmt::Display for VoiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoiceError::Config(msg) => write!(f, "{}", msg),
            VoiceError::Permission(_) => {
                write!(f, "Microphone access denied. Please allow microphone permissions.")
            }
            VoiceError::Device(_) => {
                write!(f, "No microphone found. Please connect a microphone.")
            }
            VoiceError::Audio(msg) => write!(f, "Could not access microphone: {}", msg),
            VoiceError::Transport { kind, detail } => match kind {
                TransportErrorKind::AccessDenied => write!(f, "Access Denied: Check API Key/Quota."),
                TransportErrorKind::ServiceUnavailable => write!(f, "Service Overloaded. Try later."),
                TransportErrorKind::NetworkUnreachable => write!(f, "Network Error. Check internet."),
                TransportErrorKind::Unknown if detail.is_empty() => {
                    write!(f, "Connection interrupted by server.")
                }
                TransportErrorKind::Unknown => write!(f, "Connection interrupted: {}", detail),
            },
            VoiceError::Decode(msg) => write!(f, "Audio decode error: {}", msg),
        }
    }
}

impl std::error::Error for VoiceError {}

/// Configuration loading failures are configuration errors.
impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

/// Malformed JSON from the endpoint is a protocol (transport) problem.
impl From<serde_json::Error> for VoiceError {
    fn from(err: serde_json::Error) -> Self {
        VoiceError::Transport {
            kind: TransportErrorKind::Unknown,
            detail: format!("JSON parsing error: {}", err),
        }
    }
}

/// Invalid base64 in an audio payload only affects that frame.
impl From<base64::DecodeError> for VoiceError {
    fn from(err: base64::DecodeError) -> Self {
        VoiceError::Decode(format!("invalid base64: {}", err))
    }
}

/// Shorthand for `Result<T, VoiceError>`.
pub type VoiceResult<T> = Result<T, VoiceError>;
