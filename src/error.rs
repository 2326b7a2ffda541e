//! Error taxonomy for the audio path
//!
//! None of these are fatal to the process: the session reactor reports them
//! through the state controller and keeps running.

use thiserror::Error;

/// Failures on the capture, playback or transport path
#[derive(Debug, Error)]
pub enum AudioError {
    /// Microphone permission denied or no usable device
    #[error("Microphone unavailable: {0}")]
    DeviceAccess(String),

    /// A remote audio fragment could not be decoded
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The remote session reported an error
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Reasons an inbound fragment is rejected
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("PCM payload of {len} bytes is not a whole number of {channels}-channel frames")]
    Truncated { len: usize, channels: u16 },

    #[error("Invalid MIME parameter {name}={value}")]
    BadParameter { name: String, value: String },

    #[error("Unsupported audio format: {0}")]
    Unsupported(String),

    #[error("Failed to read WAV fragment: {0}")]
    Wav(#[from] hound::Error),
}

/// Which operation raised the error currently shown to the user
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorSource {
    Device,
    Decode,
    Transport,
}

impl AudioError {
    pub fn source_kind(&self) -> ErrorSource {
        match self {
            AudioError::DeviceAccess(_) => ErrorSource::Device,
            AudioError::Decode(_) => ErrorSource::Decode,
            AudioError::Transport(_) => ErrorSource::Transport,
        }
    }
}
