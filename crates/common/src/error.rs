//! Error types shared across spanrec crates.

use std::path::PathBuf;

/// Top-level error type for spanrec operations.
#[derive(Debug, thiserror::Error)]
pub enum SpanrecError {
    #[error("No display found")]
    NoDisplayFound,

    #[error("No loopback audio device available: {message}")]
    NoLoopbackDeviceAvailable { message: String },

    #[error("Capture source error: {message}")]
    CaptureSource { message: String },

    #[error("Sink write error: {message}")]
    SinkWrite { message: String },

    #[error("Mux error: {message}")]
    Mux { message: String },

    #[error("Invalid region: {message}")]
    InvalidRegion { message: String },

    #[error("Invalid session state: {message}")]
    InvalidState { message: String },

    #[error("Audio error: {message}")]
    Audio { message: String },

    #[error("Platform error: {message}")]
    Platform { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Unsupported operation: {message}")]
    Unsupported { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using SpanrecError.
pub type SpanrecResult<T> = Result<T, SpanrecError>;

impl SpanrecError {
    pub fn no_loopback(msg: impl Into<String>) -> Self {
        Self::NoLoopbackDeviceAvailable {
            message: msg.into(),
        }
    }

    pub fn capture_source(msg: impl Into<String>) -> Self {
        Self::CaptureSource {
            message: msg.into(),
        }
    }

    pub fn sink_write(msg: impl Into<String>) -> Self {
        Self::SinkWrite {
            message: msg.into(),
        }
    }

    pub fn mux(msg: impl Into<String>) -> Self {
        Self::Mux {
            message: msg.into(),
        }
    }

    pub fn invalid_region(msg: impl Into<String>) -> Self {
        Self::InvalidRegion {
            message: msg.into(),
        }
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState {
            message: msg.into(),
        }
    }

    pub fn audio(msg: impl Into<String>) -> Self {
        Self::Audio {
            message: msg.into(),
        }
    }

    pub fn platform(msg: impl Into<String>) -> Self {
        Self::Platform {
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported {
            message: msg.into(),
        }
    }

    /// Whether the session can continue in a degraded mode after this error.
    ///
    /// Only a missing loopback device qualifies: recording carries on
    /// video-only. Everything else either terminates the session or is
    /// absorbed before it ever reaches the session.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NoLoopbackDeviceAvailable { .. })
    }
}
