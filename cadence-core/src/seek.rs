//! # Seek Coordination
//!
//! Seeks are pushed into a single last-write-wins slot. Pushing over an
//! unserviced request discards it; only the newest request ever executes,
//! and execution is serialized by `exec`.
//!
//! While playing, the scheduling thread polls the slot at the top of every
//! iteration. While paused, a short-lived worker repositions the decoder and
//! shows one frame without entering the presenting loop.

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::context::PlaybackContext;
use crate::error::PlaybackError;
use crate::events::PlaybackEvent;
use crate::frame_queue::StreamType;

/// Which keyframe to land on relative to the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeekDirection {
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeekRequest {
    pub target_ms: i64,
    pub direction: SeekDirection,
    /// Discard frames before the exact target after landing on a keyframe
    pub accurate: bool,
}

impl SeekRequest {
    pub fn new(target_ms: i64) -> Self {
        Self {
            target_ms,
            direction: SeekDirection::Backward,
            accurate: false,
        }
    }

    pub fn accurate(target_ms: i64) -> Self {
        Self {
            accurate: true,
            ..Self::new(target_ms)
        }
    }

    pub fn with_direction(mut self, direction: SeekDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn is_forward(&self) -> bool {
        self.direction == SeekDirection::Forward
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingSeek {
    pub id: u64,
    pub request: SeekRequest,
}

// ============================================================================
// Coordinator
// ============================================================================

pub struct SeekCoordinator {
    slot: Mutex<Option<PendingSeek>>,
    next_id: AtomicU64,
    discarded: AtomicU64,
    exec: Mutex<()>,
    worker_active: AtomicBool,
}

impl SeekCoordinator {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            next_id: AtomicU64::new(1),
            discarded: AtomicU64::new(0),
            exec: Mutex::new(()),
            worker_active: AtomicBool::new(false),
        }
    }

    /// Publish a request, replacing any unserviced one. Never blocks on a
    /// running seek.
    pub fn push(&self, request: SeekRequest) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let replaced = self.slot.lock().replace(PendingSeek { id, request });
        if let Some(old) = replaced {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("seek #{} superseded by #{}", old.id, id);
        }
        id
    }

    pub fn has_pending(&self) -> bool {
        self.slot.lock().is_some()
    }

    pub fn take(&self) -> Option<PendingSeek> {
        self.slot.lock().take()
    }

    /// Held for the whole execution of one seek
    pub fn lock_exec(&self) -> MutexGuard<'_, ()> {
        self.exec.lock()
    }

    pub fn is_worker_active(&self) -> bool {
        self.worker_active.load(Ordering::SeqCst)
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

impl Default for SeekCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Execution
// ============================================================================

/// Pause the decoder, reposition it, and open a resync boundary on every
/// queue. On failure the queues are left untouched.
pub fn reposition(ctx: &PlaybackContext, pending: &PendingSeek) -> Result<i64, PlaybackError> {
    let request = pending.request;
    tracing::info!(
        "seek #{} to {} ms ({:?}, accurate={})",
        pending.id,
        request.target_ms,
        request.direction,
        request.accurate
    );

    ctx.decoder.pause();
    match ctx
        .decoder
        .seek(request.target_ms, request.is_forward(), request.accurate)
    {
        Ok(landed_ms) => {
            ctx.clear_queues(ctx.clock.direction());
            ctx.stats.seek_executed();
            tracing::debug!("seek #{} landed at {} ms", pending.id, landed_ms);
            Ok(landed_ms)
        }
        Err(e) => {
            let err = PlaybackError::from(e);
            ctx.stats.seek_failed();
            tracing::warn!("seek #{} failed: {}", pending.id, err);
            Err(err)
        }
    }
}

/// Start a paused-seek worker unless one is already draining the slot.
pub fn spawn_paused_worker(
    ctx: Arc<PlaybackContext>,
) -> Result<Option<JoinHandle<()>>, PlaybackError> {
    if ctx.seeks.worker_active.swap(true, Ordering::SeqCst) {
        return Ok(None);
    }

    let worker_ctx = ctx.clone();
    let spawned = thread::Builder::new()
        .name("cadence-seek".into())
        .spawn(move || {
            let ctx = worker_ctx;
            loop {
                drain_paused(&ctx);
                ctx.seeks.worker_active.store(false, Ordering::SeqCst);
                // Catch a push that landed between the last take() and the
                // flag reset.
                let again = ctx.seeks.has_pending()
                    && ctx.is_pause_requested()
                    && ctx.has_started()
                    && !ctx.is_stop_requested();
                if !again || ctx.seeks.worker_active.swap(true, Ordering::SeqCst) {
                    break;
                }
            }
        });

    match spawned {
        Ok(handle) => Ok(Some(handle)),
        Err(e) => {
            ctx.seeks.worker_active.store(false, Ordering::SeqCst);
            Err(PlaybackError::Spawn(format!("seek: {}", e)))
        }
    }
}

pub(crate) fn drain_paused(ctx: &PlaybackContext) {
    loop {
        // Once playback resumes the scheduling thread owns pending seeks.
        if ctx.is_stop_requested() || !ctx.is_pause_requested() {
            return;
        }
        let _exec = ctx.seeks.lock_exec();
        let Some(pending) = ctx.seeks.take() else {
            return;
        };
        execute_paused(ctx, &pending);
    }
}

fn execute_paused(ctx: &PlaybackContext, pending: &PendingSeek) {
    match reposition(ctx, pending) {
        Ok(landed_ms) => {
            let shown = present_single_frame(ctx, pending, landed_ms);
            ctx.events.emit(PlaybackEvent::SeekCompleted {
                id: pending.id,
                result_ms: shown.unwrap_or(landed_ms),
                error: None,
            });
        }
        Err(err) => {
            ctx.events.emit(PlaybackEvent::SeekCompleted {
                id: pending.id,
                result_ms: ctx.position_ms(),
                error: Some(err.clone()),
            });
            if err.is_terminal() {
                ctx.terminate(Some(err));
            }
        }
    }
}

/// Decode up to the first frame at the target and show it. Returns the
/// shown position in ms.
fn present_single_frame(ctx: &PlaybackContext, pending: &PendingSeek, landed_ms: i64) -> Option<i64> {
    let speed = ctx.clock.speed();
    let Some(video) = ctx.queue(StreamType::Video) else {
        ctx.clock.rebase(landed_ms * 1000, speed);
        return None;
    };

    let target_us = pending.request.target_ms * 1000;
    let deadline = ctx.time.now_us() + ctx.config.buffering.timeout_ms as i64 * 1000;
    ctx.decoder.start();

    let shown = loop {
        if ctx.should_interrupt() || !ctx.is_pause_requested() {
            // Superseded or resumed before the target decoded; let the scheduler realign.
            ctx.request_resync();
            break None;
        }
        if pending.request.accurate {
            video.discard_before(target_us);
        }
        if let Some(frame) = video.try_dequeue() {
            ctx.renderer.present(&frame);
            ctx.clock.rebase(frame.pts_us, speed);
            if let (Some(audio), Some(sink)) = (ctx.queue(StreamType::Audio), &ctx.audio_sink) {
                audio.discard_before(frame.pts_us - sink.device_delay_us());
            }
            if let Some(subs) = ctx.queue(StreamType::Subtitle) {
                subs.discard_ended_before(frame.pts_us);
            }
            break Some(frame.pts_us / 1000);
        }
        if video.is_eos() || ctx.time.now_us() >= deadline {
            tracing::warn!("seek #{}: no frame to show after landing", pending.id);
            ctx.clock.rebase(landed_ms * 1000, speed);
            break None;
        }
        ctx.sleep(ctx.poll_interval());
    };

    ctx.decoder.pause();
    shown
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_push_wins() {
        let seeks = SeekCoordinator::new();
        for ms in [1_000, 2_000, 3_000, 4_000] {
            seeks.push(SeekRequest::new(ms));
        }
        let taken = seeks.take().expect("pending seek");
        assert_eq!(taken.request.target_ms, 4_000);
        assert_eq!(taken.id, 4);
        assert_eq!(seeks.discarded(), 3);
        assert!(seeks.take().is_none());
    }

    #[test]
    fn concurrent_pushes_leave_one_request() {
        let seeks = Arc::new(SeekCoordinator::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let seeks = seeks.clone();
                thread::spawn(move || {
                    for j in 0..100 {
                        seeks.push(SeekRequest::new(i * 1_000 + j));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(seeks.take().is_some());
        assert!(!seeks.has_pending());
        assert_eq!(seeks.discarded(), 799);
    }

    #[test]
    fn request_builders() {
        let req = SeekRequest::accurate(5_000).with_direction(SeekDirection::Forward);
        assert!(req.accurate);
        assert!(req.is_forward());
        assert!(!SeekRequest::new(0).is_forward());
    }
}
