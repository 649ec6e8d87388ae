//! Error types for the audio engine.
//!
//! Construction-time failures (a malformed asset, a missing output device)
//! surface as [`AudioError`]. Runtime playback control is deliberately
//! forgiving: an instance id the engine no longer knows about is never an
//! error, it just answers with a sentinel.

use thiserror::Error;

/// Audio engine error types.
#[derive(Debug, Error)]
pub enum AudioError {
    /// The asset header is malformed or the format is unsupported.
    #[error("Failed to load audio asset '{name}': {message}")]
    AssetLoad {
        /// Name the asset was opened under.
        name: String,
        /// Error message.
        message: String,
    },

    /// A caller-supplied argument is out of range.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Every voice is bound and none of them may be evicted.
    #[error("No evictable voice available (capacity: {capacity})")]
    ResourceExhausted {
        /// Number of voices the engine owns.
        capacity: usize,
    },

    /// Failed to initialize the output device.
    #[error("Failed to initialize audio device: {0}")]
    DeviceInitFailed(String),

    /// IO error while reading an asset handle.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AudioError {
    pub(crate) fn asset(name: &str, message: impl ToString) -> Self {
        Self::AssetLoad {
            name: name.to_string(),
            message: message.to_string(),
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}

/// Result type for audio operations.
pub type AudioResult<T> = Result<T, AudioError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_error_display() {
        let err = AudioError::ResourceExhausted { capacity: 4 };
        assert!(err.to_string().contains("capacity: 4"));

        let err = AudioError::asset("theme.ogg", "bad header");
        assert!(err.to_string().contains("theme.ogg"));
        assert!(err.to_string().contains("bad header"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let err: AudioError = io.into();
        assert!(matches!(err, AudioError::Io(_)));
    }
}
