// Audio output interface
// The physical device lives behind AudioSink; the synchronizer only decides
// which frames to push and when.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::clock::TimeSource;
use crate::frame_queue::Frame;

// ============================================================================
// Sink Trait
// ============================================================================

/// Audio device with its own internal buffering.
///
/// Implementations guard their ring buffer with their own lock: the audio
/// thread feeds it while buffering and seek paths clear it.
pub trait AudioSink: Send + Sync {
    fn add_samples(&self, frame: Frame);

    fn clear_buffer(&self);

    /// Audio queued in the device, microseconds
    fn buffered_duration_us(&self) -> i64;

    /// Output latency between `add_samples` and the speaker, microseconds
    fn device_delay_us(&self) -> i64;
}

// ============================================================================
// Simulated Device
// ============================================================================

struct SinkState {
    queued_us: i64,
    last_drain_us: i64,
    fed_pts: Vec<i64>,
    clears: u64,
}

/// In-memory device that drains in real (or manual) time.
pub struct SimulatedAudioSink {
    time: Arc<dyn TimeSource>,
    device_delay_us: i64,
    state: Mutex<SinkState>,
}

impl SimulatedAudioSink {
    pub fn new(time: Arc<dyn TimeSource>, device_delay_us: i64) -> Self {
        let now = time.now_us();
        Self {
            time,
            device_delay_us,
            state: Mutex::new(SinkState {
                queued_us: 0,
                last_drain_us: now,
                fed_pts: Vec::new(),
                clears: 0,
            }),
        }
    }

    fn drain(&self, state: &mut SinkState) {
        let now = self.time.now_us();
        let played = (now - state.last_drain_us).max(0);
        state.queued_us = (state.queued_us - played).max(0);
        state.last_drain_us = now;
    }

    /// Timestamps of every frame pushed to the device, in order
    pub fn fed_timestamps(&self) -> Vec<i64> {
        self.state.lock().fed_pts.clone()
    }

    pub fn clear_count(&self) -> u64 {
        self.state.lock().clears
    }
}

impl AudioSink for SimulatedAudioSink {
    fn add_samples(&self, frame: Frame) {
        let mut state = self.state.lock();
        self.drain(&mut state);
        state.queued_us += frame.duration_us.max(0);
        state.fed_pts.push(frame.pts_us);
    }

    fn clear_buffer(&self) {
        let mut state = self.state.lock();
        self.drain(&mut state);
        state.queued_us = 0;
        state.clears += 1;
    }

    fn buffered_duration_us(&self) -> i64 {
        let mut state = self.state.lock();
        self.drain(&mut state);
        state.queued_us
    }

    fn device_delay_us(&self) -> i64 {
        self.device_delay_us
    }
}

// ============================================================================
// Tests
// ============================================================================
