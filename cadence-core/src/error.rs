//! Playback error kinds.
//!
//! Errors are captured on the thread that hit them and surfaced once through
//! `PlaybackEvent::PlaybackStopped`; they never cross a thread boundary as a
//! panic or a returned `Result` from a worker.

use thiserror::Error;

use crate::config::ConfigError;
use crate::decode::DecodeError;
use crate::frame_queue::StreamType;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlaybackError {
    #[error("{operation} timed out after {elapsed_ms} ms")]
    Timeout { operation: String, elapsed_ms: u64 },
    #[error("{0} stream exhausted while buffering")]
    Exhausted(StreamType),
    #[error("Playback stopped advancing unexpectedly")]
    UnexpectedStop,
    #[error("Seek failed: {0}")]
    SeekFailed(String),
    #[error("Buffering failed: no playable frame found")]
    BufferingFailed,
    #[error("Reverse playback not supported by decoder")]
    ReverseUnsupported,
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Decoder error: {0}")]
    Decoder(DecodeError),
    #[error("Failed to spawn {0} thread")]
    Spawn(String),
}

impl From<DecodeError> for PlaybackError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::Timeout(ms) => PlaybackError::Timeout {
                operation: "decoder I/O".into(),
                elapsed_ms: ms,
            },
            DecodeError::ReverseUnsupported => PlaybackError::ReverseUnsupported,
            DecodeError::SeekFailed(msg) => PlaybackError::SeekFailed(msg),
            other => PlaybackError::Decoder(other),
        }
    }
}

impl PlaybackError {
    /// Errors that end playback. Seek failures are logged and playback
    /// continues from the current queue state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PlaybackError::SeekFailed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_timeout_maps_to_timeout() {
        let err: PlaybackError = DecodeError::Timeout(1500).into();
        assert!(matches!(err, PlaybackError::Timeout { elapsed_ms: 1500, .. }));
        assert!(err.is_terminal());
        assert_eq!(err.to_string(), "decoder I/O timed out after 1500 ms");
    }

    #[test]
    fn seek_failure_is_not_terminal() {
        let err: PlaybackError = DecodeError::SeekFailed("bad offset".into()).into();
        assert!(!err.is_terminal());
    }

    #[test]
    fn exhausted_names_stream() {
        let err = PlaybackError::Exhausted(StreamType::Audio);
        assert_eq!(err.to_string(), "audio stream exhausted while buffering");
    }
}
