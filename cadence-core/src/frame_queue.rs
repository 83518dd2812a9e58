//! # Frame Queue - Decoder to Synchronizer Handoff
//!
//! One bounded FIFO per stream type:
//! - Single producer (decoder) / single consumer (synchronizer)
//! - Timestamps are non-decreasing between resync boundaries
//!   (non-increasing while the queue runs in reverse order)
//! - `clear()` may be called from any thread under the queue's own lock
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐    ┌────────────┐    ┌──────────────┐
//! │ Decoder  │───►│ FrameQueue │───►│ Synchronizer │
//! │ Thread   │    │ (per type) │    │ Thread       │
//! └──────────┘    └────────────┘    └──────────────┘
//! ```

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::clock::Direction;

// ============================================================================
// Frame Data
// ============================================================================

/// Stream types handled by the synchronizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamType {
    Video,
    Audio,
    Subtitle,
    Data,
}

impl StreamType {
    pub const ALL: [StreamType; 4] = [
        StreamType::Video,
        StreamType::Audio,
        StreamType::Subtitle,
        StreamType::Data,
    ];

    pub fn index(self) -> usize {
        match self {
            StreamType::Video => 0,
            StreamType::Audio => 1,
            StreamType::Subtitle => 2,
            StreamType::Data => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StreamType::Video => "video",
            StreamType::Audio => "audio",
            StreamType::Subtitle => "subtitle",
            StreamType::Data => "data",
        }
    }

    /// Subtitles and data tolerate a wide sync window
    pub fn is_sideband(self) -> bool {
        matches!(self, StreamType::Subtitle | StreamType::Data)
    }
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded frame of any stream type.
///
/// Dropping the frame disposes its payload. Ownership moves to the
/// synchronizer on dequeue.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Stream this frame belongs to
    pub stream: StreamType,
    /// Presentation timestamp (microseconds)
    pub pts_us: i64,
    /// Frame duration (microseconds)
    pub duration_us: i64,
    /// Is this a keyframe/IDR?
    pub keyframe: bool,
    /// Interlaced content eligible for double-rate output
    pub interlaced: bool,
    /// Opaque decoded payload
    pub payload: Bytes,
}

impl Frame {
    pub fn new(stream: StreamType, pts_us: i64, duration_us: i64, payload: Bytes) -> Self {
        Self {
            stream,
            pts_us,
            duration_us,
            keyframe: false,
            interlaced: false,
            payload,
        }
    }

    pub fn with_keyframe(mut self, keyframe: bool) -> Self {
        self.keyframe = keyframe;
        self
    }

    pub fn with_interlaced(mut self, interlaced: bool) -> Self {
        self.interlaced = interlaced;
        self
    }

    pub fn end_us(&self) -> i64 {
        self.pts_us + self.duration_us
    }

    pub fn info(&self) -> FrameInfo {
        FrameInfo {
            stream: self.stream,
            pts_us: self.pts_us,
            duration_us: self.duration_us,
            interlaced: self.interlaced,
        }
    }
}

/// Timing view of a queued frame, returned by `peek`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub stream: StreamType,
    pub pts_us: i64,
    pub duration_us: i64,
    pub interlaced: bool,
}

impl FrameInfo {
    pub fn end_us(&self) -> i64 {
        self.pts_us + self.duration_us
    }
}

// ============================================================================
// Frame Queue Configuration
// ============================================================================

/// Queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum frames to buffer
    pub max_frames: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_frames: 32, // ~1 second at 30fps
        }
    }
}

/// Result of an enqueue attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queue at capacity; the frame was not taken
    Full,
    /// Timestamp went backwards without a resync boundary; frame discarded
    OutOfOrder,
}

// ============================================================================
// Frame Queue
// ============================================================================

struct QueueInner {
    frames: VecDeque<Frame>,
    /// Last enqueued PTS since the most recent resync boundary
    last_pts_us: Option<i64>,
    order: Direction,
}

/// Bounded FIFO for one stream type
pub struct FrameQueue {
    stream: StreamType,
    config: QueueConfig,
    inner: Mutex<QueueInner>,

    /// Condition variable for producers waiting on space
    space_cond: Condvar,

    /// Whether EOS has been signaled
    eos: AtomicBool,

    /// Resync generation (incremented on clear/resync)
    generation: AtomicU64,

    frames_pushed: AtomicU64,
    frames_popped: AtomicU64,
    frames_disposed: AtomicU64,
    frames_rejected: AtomicU64,
}

impl FrameQueue {
    pub fn new(stream: StreamType, config: QueueConfig) -> Self {
        let capacity = config.max_frames.max(1);
        Self {
            stream,
            config: QueueConfig {
                max_frames: capacity,
            },
            inner: Mutex::new(QueueInner {
                frames: VecDeque::with_capacity(capacity),
                last_pts_us: None,
                order: Direction::Forward,
            }),
            space_cond: Condvar::new(),
            eos: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            frames_pushed: AtomicU64::new(0),
            frames_popped: AtomicU64::new(0),
            frames_disposed: AtomicU64::new(0),
            frames_rejected: AtomicU64::new(0),
        }
    }

    pub fn with_capacity(stream: StreamType, max_frames: usize) -> Self {
        Self::new(stream, QueueConfig { max_frames })
    }

    pub fn stream(&self) -> StreamType {
        self.stream
    }

    pub fn capacity(&self) -> usize {
        self.config.max_frames
    }

    // ========================================================================
    // Producer API (Decoder Thread)
    // ========================================================================

    /// Push a decoded frame without blocking.
    pub fn enqueue(&self, frame: Frame) -> PushOutcome {
        let mut inner = self.inner.lock();
        self.enqueue_locked(&mut inner, frame)
    }

    /// Push, waiting up to `timeout` for space.
    pub fn enqueue_blocking(&self, frame: Frame, timeout: Duration) -> PushOutcome {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();

        while inner.frames.len() >= self.config.max_frames {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return PushOutcome::Full;
            }
            self.space_cond.wait_for(&mut inner, remaining);
        }

        self.enqueue_locked(&mut inner, frame)
    }

    fn enqueue_locked(&self, inner: &mut QueueInner, frame: Frame) -> PushOutcome {
        if inner.frames.len() >= self.config.max_frames {
            return PushOutcome::Full;
        }

        if let Some(last) = inner.last_pts_us {
            let backwards = match inner.order {
                Direction::Forward => frame.pts_us < last,
                Direction::Reverse => frame.pts_us > last,
            };
            if backwards {
                self.frames_rejected.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(
                    "{} queue rejected out-of-order frame {} (last {})",
                    self.stream,
                    frame.pts_us,
                    last
                );
                return PushOutcome::OutOfOrder;
            }
        }

        inner.last_pts_us = Some(frame.pts_us);
        inner.frames.push_back(frame);
        self.frames_pushed.fetch_add(1, Ordering::Relaxed);
        PushOutcome::Queued
    }

    /// Signal end of stream
    pub fn signal_eos(&self) {
        self.eos.store(true, Ordering::SeqCst);
    }

    pub fn clear_eos(&self) {
        self.eos.store(false, Ordering::SeqCst);
    }

    pub fn is_eos(&self) -> bool {
        self.eos.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Consumer API (Synchronizer Thread)
    // ========================================================================

    /// Take the next frame. Ownership passes to the caller.
    pub fn try_dequeue(&self) -> Option<Frame> {
        let mut inner = self.inner.lock();
        let frame = inner.frames.pop_front()?;
        self.frames_popped.fetch_add(1, Ordering::Relaxed);
        drop(inner);
        self.space_cond.notify_one();
        Some(frame)
    }

    /// Timing of the next frame without removing it
    pub fn peek(&self) -> Option<FrameInfo> {
        self.inner.lock().frames.front().map(Frame::info)
    }

    /// Dispose of frames that lie before `bound_us` in the queue's order.
    /// Returns how many were dropped.
    pub fn discard_before(&self, bound_us: i64) -> usize {
        let mut inner = self.inner.lock();
        let order = inner.order;
        let mut dropped = 0;
        while let Some(front) = inner.frames.front() {
            let stale = match order {
                Direction::Forward => front.pts_us < bound_us,
                Direction::Reverse => front.pts_us > bound_us,
            };
            if !stale {
                break;
            }
            inner.frames.pop_front();
            dropped += 1;
        }
        drop(inner);
        if dropped > 0 {
            self.frames_disposed.fetch_add(dropped as u64, Ordering::Relaxed);
            self.space_cond.notify_all();
        }
        dropped
    }

    /// Dispose of frames whose display window ended before `bound_us`.
    pub fn discard_ended_before(&self, bound_us: i64) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.frames.len();
        inner.frames.retain(|f| f.end_us() >= bound_us);
        let dropped = before - inner.frames.len();
        drop(inner);
        if dropped > 0 {
            self.frames_disposed.fetch_add(dropped as u64, Ordering::Relaxed);
            self.space_cond.notify_all();
        }
        dropped
    }

    // ========================================================================
    // Control API
    // ========================================================================

    /// Dispose every queued frame. Starts a new resync segment.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let dropped = inner.frames.len();
        inner.frames.clear();
        inner.last_pts_us = None;
        drop(inner);

        self.eos.store(false, Ordering::SeqCst);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.frames_disposed.fetch_add(dropped as u64, Ordering::Relaxed);
        self.space_cond.notify_all();

        tracing::debug!(
            "{} queue cleared ({} frames), generation {}",
            self.stream,
            dropped,
            generation
        );
        dropped
    }

    /// Open a resync boundary: the next frame may jump in time, and
    /// subsequent frames must follow `order`.
    pub fn mark_resync(&self, order: Direction) {
        let mut inner = self.inner.lock();
        inner.last_pts_us = None;
        inner.order = order;
        drop(inner);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn order(&self) -> Direction {
        self.inner.lock().order
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Status API
    // ========================================================================

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().frames.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.inner.lock().frames.len() >= self.config.max_frames
    }

    /// Span of presentation time covered by queued frames
    pub fn buffered_duration_us(&self) -> i64 {
        let inner = self.inner.lock();
        Self::span(&inner.frames)
    }

    fn span(frames: &VecDeque<Frame>) -> i64 {
        match (frames.front(), frames.back()) {
            (Some(first), Some(last)) => {
                let lo = first.pts_us.min(last.pts_us);
                let hi = first.end_us().max(last.end_us());
                (hi - lo).max(0)
            }
            _ => 0,
        }
    }

    /// Get queue statistics
    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            stream: self.stream,
            buffered_frames: inner.frames.len(),
            buffer_duration_us: Self::span(&inner.frames),
            frames_pushed: self.frames_pushed.load(Ordering::Relaxed),
            frames_popped: self.frames_popped.load(Ordering::Relaxed),
            frames_disposed: self.frames_disposed.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            is_eos: self.eos.load(Ordering::SeqCst),
        }
    }
}

/// Queue statistics
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub stream: StreamType,
    pub buffered_frames: usize,
    pub buffer_duration_us: i64,
    pub frames_pushed: u64,
    pub frames_popped: u64,
    pub frames_disposed: u64,
    pub frames_rejected: u64,
    pub is_eos: bool,
}

// ============================================================================
// Tests
// ============================================================================
