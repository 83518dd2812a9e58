//! # Cadence Core
//!
//! Real-time multi-stream playback synchronizer. Aligns decoded video,
//! audio, subtitle and data frames to one presentation clock while
//! coordinating buffering, seeking, latency-driven speed changes and
//! reverse playback.

// ============================================================================
// Timing
// ============================================================================
pub mod clock;
pub mod frame_queue;

// ============================================================================
// Collaborators
// ============================================================================
pub mod decode;
pub mod render;
pub mod audio;
pub mod synthetic;

// ============================================================================
// Shared State
// ============================================================================
pub mod config;
pub mod error;
pub mod events;
pub mod stats;
pub mod context;

// ============================================================================
// Scheduling
// ============================================================================
pub mod buffering;
pub mod seek;
pub mod sync;
pub mod audio_sync;
pub mod latency;
pub mod reverse;
pub mod player;

pub use clock::{Direction, ManualTimeSource, PlaybackClock, SystemTimeSource, TimeSource};
pub use config::SyncConfig;
pub use error::PlaybackError;
pub use events::PlaybackEvent;
pub use frame_queue::{Frame, FrameQueue, StreamType};
pub use player::Player;
pub use seek::SeekRequest;
pub use sync::PlaybackState;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
