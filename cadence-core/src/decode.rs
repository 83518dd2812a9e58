//! # Decoder Interface
//!
//! The synchronizer consumes decoded frames; demuxing and decoding live
//! behind this trait. Implementations own the producer side of each
//! [`FrameQueue`] and run their own threads.
//!
//! All methods take `&self`: the decoder is shared between the scheduling
//! thread, the audio thread, and short-lived seek workers.

use std::sync::Arc;
use thiserror::Error;

use crate::frame_queue::{FrameQueue, StreamType};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("I/O timed out after {0} ms")]
    Timeout(u64),
    #[error("Seek failed: {0}")]
    SeekFailed(String),
    #[error("Reverse demuxing not supported")]
    ReverseUnsupported,
    #[error("Decode failed: {0}")]
    DecodeFailed(String),
    #[error("Decoder stopped")]
    Stopped,
}

/// Decoder run state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderStatus {
    Running,
    Paused,
    /// All output queues are full; decoding is throttled
    QueueFull,
    /// Every enabled stream reached end of input
    Ended,
    Stopped,
}

/// Decoder trait - implemented by every demux/decode backend
pub trait Decoder: Send + Sync {
    /// Get decoder name for debugging
    fn name(&self) -> &str;

    /// Start (or resume) demuxing and decoding all enabled streams
    fn start(&self);

    /// Pause production; queued frames stay in place
    fn pause(&self);

    /// Discard queued packets and decoded frames
    fn flush(&self);

    /// Reposition every stream. Returns the position landed on, in ms.
    fn seek(&self, target_ms: i64, forward: bool, accurate: bool) -> Result<i64, DecodeError>;

    /// Output queue for a stream, `None` when the stream is disabled
    fn queue(&self, stream: StreamType) -> Option<Arc<FrameQueue>>;

    fn status(&self) -> DecoderStatus;

    /// A stream switch happened and the clock must be realigned
    fn requires_resync(&self) -> bool {
        false
    }

    /// Acknowledge a resync at `pts_us`
    fn resync(&self, _pts_us: i64) {}

    fn supports_reverse(&self) -> bool {
        false
    }

    /// Switch to reverse demuxing (a window of prior keyframe-aligned packets)
    fn set_reverse(&self, reverse: bool) -> Result<(), DecodeError> {
        if reverse {
            Err(DecodeError::ReverseUnsupported)
        } else {
            Ok(())
        }
    }

    /// Live sources enable latency regulation in `LatencyMode::Auto`
    fn is_live(&self) -> bool {
        false
    }

    /// Demuxed packets waiting to be decoded
    fn queued_packets(&self) -> usize {
        0
    }

    /// Presentation time covered by demuxed-but-undecoded packets
    fn demuxed_duration_us(&self) -> i64 {
        0
    }
}
