//! Error types for the recorder.

use std::io;

/// Top-level error type for recording operations.
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Dependency unavailable: {message}")]
    DependencyUnavailable { message: String },

    #[error("No audio device found")]
    NoDeviceFound,

    #[error("Already recording session {session_id}")]
    AlreadyRecording { session_id: String },

    #[error("No active recording")]
    NotRecording,

    #[error("Encoder subprocess failure: {message}")]
    SubprocessFailure { message: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result type alias using RecorderError.
pub type RecorderResult<T> = Result<T, RecorderError>;

impl RecorderError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn dependency(msg: impl Into<String>) -> Self {
        Self::DependencyUnavailable {
            message: msg.into(),
        }
    }

    pub fn subprocess(msg: impl Into<String>) -> Self {
        Self::SubprocessFailure {
            message: msg.into(),
        }
    }
}
