//! # Synchronizer
//!
//! Main scheduling loop. Every decoded frame is measured against the
//! playback clock:
//!
//! ```text
//! distance = (frame.pts - clock.elapsed) / speed
//!
//!   -inf ...... -catch_up ...... -jitter .. +jitter ...... +inf
//!   | rebuffer  |      drop      | present |     wait      |
//! ```
//!
//! Subtitle and data frames use a wider deadband and are dropped rather than
//! triggering a rebuffer.
//!
//! ```text
//!              seek                  underrun / lag / flush
//!   Presenting ------> Seeking       Presenting ------> Buffering
//!        ^                |               ^                 |
//!        +----------------+---------------+-----------------+
//!   Presenting -> Ended  (decoder EOF, nothing left within tolerance)
//!   *          -> Stopped (stop request or terminal error)
//! ```

use serde::Serialize;
use std::sync::Arc;

use crate::buffering::{BufferingController, BufferingOutcome, BufferingReason};
use crate::clock::{clamp_speed, Direction};
use crate::config::SyncPolicy;
use crate::context::PlaybackContext;
use crate::decode::DecoderStatus;
use crate::error::PlaybackError;
use crate::events::PlaybackEvent;
use crate::frame_queue::{Frame, FrameQueue, StreamType};
use crate::latency::{LatencyAction, LatencyController, LatencySample};
use crate::reverse::ReversePlaybackController;
use crate::seek::{self, PendingSeek};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PlaybackState {
    Buffering,
    Presenting,
    Seeking,
    Paused,
    Stopped,
    Ended,
}

/// Decision for one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Present,
    Drop,
    /// Too far behind to catch up frame by frame
    Rebuffer,
    /// Due in this many wall-clock microseconds
    Wait(i64),
}

/// Classify a frame by its wall-clock distance from the clock.
pub fn classify(distance_us: i64, stream: StreamType, policy: &SyncPolicy) -> SyncAction {
    if stream.is_sideband() {
        if distance_us.abs() <= policy.sideband_deadband_us {
            SyncAction::Present
        } else if distance_us < 0 {
            SyncAction::Drop
        } else {
            SyncAction::Wait(distance_us)
        }
    } else if distance_us.abs() <= policy.jitter_band_us {
        SyncAction::Present
    } else if distance_us < -policy.catch_up_bound_us {
        SyncAction::Rebuffer
    } else if distance_us < 0 {
        SyncAction::Drop
    } else {
        SyncAction::Wait(distance_us)
    }
}

/// Wall-clock distance of `pts_us` ahead of the clock, in the direction of
/// travel.
pub fn timeline_distance(pts_us: i64, elapsed_us: i64, speed: f64, direction: Direction) -> i64 {
    let raw = match direction {
        Direction::Forward => pts_us - elapsed_us,
        Direction::Reverse => elapsed_us - pts_us,
    };
    (raw as f64 / speed) as i64
}

/// Outcome of one video presentation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameStep {
    Presented,
    Wait(i64),
    Rebuffer,
    Empty,
}

// ============================================================================
// Segment Tracking
// ============================================================================

/// Ordering state for the current presentation segment (between resync
/// boundaries).
#[derive(Debug, Default)]
pub(crate) struct SegmentTracker {
    last_pts: [Option<i64>; 4],
    /// Timeline point the last video frame covers up to, in the direction
    /// of travel
    boundary_us: Option<i64>,
}

impl SegmentTracker {
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    /// Whether `pts_us` keeps the stream monotonic in `direction`
    pub(crate) fn accepts(&self, stream: StreamType, pts_us: i64, direction: Direction) -> bool {
        match self.last_pts[stream.index()] {
            None => true,
            Some(last) => match direction {
                Direction::Forward => pts_us >= last,
                Direction::Reverse => pts_us <= last,
            },
        }
    }

    pub(crate) fn record(&mut self, frame: &Frame, direction: Direction) {
        self.last_pts[frame.stream.index()] = Some(frame.pts_us);
        if frame.stream == StreamType::Video {
            self.boundary_us = Some(match direction {
                Direction::Forward => frame.end_us(),
                Direction::Reverse => frame.pts_us - frame.duration_us,
            });
        }
    }

    pub(crate) fn boundary_us(&self) -> Option<i64> {
        self.boundary_us
    }
}

struct Watchdog {
    elapsed_us: i64,
    since_us: i64,
}

// ============================================================================
// Synchronizer
// ============================================================================

pub struct Synchronizer {
    ctx: Arc<PlaybackContext>,
    buffering: BufferingController,
    latency: LatencyController,
    reverse: ReversePlaybackController,
    /// Buffering episode waiting to run
    pending: Option<(BufferingReason, Option<i64>)>,
    /// Pause state currently applied to the clock
    paused: bool,
    /// First buffering completed
    started: bool,
    tracker: SegmentTracker,
    /// Interlaced frame whose second field is still due
    second_field: Option<Frame>,
    overlay_until_us: Option<i64>,
    watchdog: Watchdog,
}

impl Synchronizer {
    pub fn new(ctx: Arc<PlaybackContext>) -> Self {
        let now = ctx.time.now_us();
        Self {
            buffering: BufferingController::new(ctx.clone()),
            latency: LatencyController::new(ctx.config.latency.clone()),
            reverse: ReversePlaybackController::new(ctx.clone()),
            pending: Some((BufferingReason::Initial, None)),
            paused: ctx.is_pause_requested(),
            started: false,
            tracker: SegmentTracker::default(),
            second_field: None,
            overlay_until_us: None,
            watchdog: Watchdog {
                elapsed_us: 0,
                since_us: now,
            },
            ctx,
        }
    }

    pub fn context(&self) -> &Arc<PlaybackContext> {
        &self.ctx
    }

    /// Run until stopped.
    pub fn run(mut self) {
        tracing::info!("synchronizer started ({})", self.ctx.decoder.name());
        while self.step() != PlaybackState::Stopped {}
        tracing::info!("synchronizer exited");
    }

    /// One scheduling iteration. Returns the state afterwards.
    pub fn step(&mut self) -> PlaybackState {
        let ctx = self.ctx.clone();
        if ctx.is_stop_requested() {
            self.shutdown();
            return PlaybackState::Stopped;
        }

        let want_pause = ctx.is_pause_requested();
        if want_pause != self.paused {
            self.apply_pause(want_pause);
        }

        // Seeks preempt everything else while playing
        if !self.paused || !self.started {
            if let Some(pending) = ctx.seeks.take() {
                self.execute_seek(pending);
                return ctx.state();
            }
        } else if ctx.seeks.has_pending() && !ctx.seeks.is_worker_active() {
            // Queued before the first frame settled, so no worker picked it up
            seek::drain_paused(&ctx);
        }

        if let Some(speed) = ctx.take_speed_request() {
            self.apply_speed(speed);
        }
        if ctx.is_reverse_requested() != ctx.is_reverse_active() {
            self.toggle_reverse();
        }
        if ctx.take_resync_request() {
            self.schedule(BufferingReason::Seek, None);
        }
        if ctx.decoder.requires_resync() {
            self.schedule(BufferingReason::StreamSwitch, None);
        }

        if !self.paused || !self.started {
            if let Some((reason, floor)) = self.pending.take() {
                let outcome = self.buffer(reason, floor);
                self.settle(reason, floor, outcome);
                return ctx.state();
            }
        }

        match ctx.state() {
            PlaybackState::Presenting => self.present(),
            PlaybackState::Stopped => {}
            _ => ctx.sleep(ctx.poll_interval()),
        }
        ctx.state()
    }

    fn schedule(&mut self, reason: BufferingReason, floor_us: Option<i64>) {
        if self.pending.is_none() {
            tracing::debug!("rebuffer scheduled ({:?})", reason);
            self.pending = Some((reason, floor_us));
        }
    }

    fn shutdown(&mut self) {
        if self.overlay_until_us.take().is_some() {
            self.ctx.renderer.clear_overlay_texture();
        }
        self.ctx.decoder.pause();
        if !self.ctx.is_terminated() {
            self.ctx.terminate(None);
        }
    }

    // ========================================================================
    // Control
    // ========================================================================

    fn apply_pause(&mut self, paused: bool) {
        let ctx = self.ctx.clone();
        self.paused = paused;
        let ended = ctx.state() == PlaybackState::Ended;
        if paused {
            tracing::info!("paused at {} ms", ctx.position_ms());
            ctx.clock.pause();
            if let Some(sink) = &ctx.audio_sink {
                sink.clear_buffer();
            }
            if self.started && !ended {
                ctx.set_state(PlaybackState::Paused);
            }
        } else {
            tracing::info!("resumed at {} ms", ctx.position_ms());
            ctx.decoder.start();
            if self.started && !ended {
                ctx.clock.resume();
                self.reset_watchdog();
                ctx.set_state(PlaybackState::Presenting);
            }
        }
    }

    fn apply_speed(&mut self, speed: f64) {
        let ctx = &self.ctx;
        let speed = clamp_speed(speed);
        if (speed - ctx.clock.speed()).abs() < f64::EPSILON {
            return;
        }
        tracing::info!("speed {:.2}x -> {:.2}x", ctx.clock.speed(), speed);
        ctx.clock.set_speed(speed);
        ctx.stats.speed_change();
        ctx.events.emit(PlaybackEvent::SpeedChanged { speed });
    }

    fn toggle_reverse(&mut self) {
        let ctx = self.ctx.clone();
        let enter = ctx.is_reverse_requested();
        let result = if enter {
            self.reverse.enter()
        } else {
            self.reverse.exit()
        };
        match result {
            Ok(_) => {
                self.tracker.reset();
                self.second_field = None;
                self.clear_overlay();
                self.pending = Some((BufferingReason::DirectionChange, None));
            }
            Err(err @ (PlaybackError::ReverseUnsupported | PlaybackError::SeekFailed(_))) => {
                tracing::warn!("direction change rejected: {}", err);
                ctx.request_reverse(ctx.is_reverse_active());
            }
            Err(err) => ctx.terminate(Some(err)),
        }
    }

    // ========================================================================
    // Seeking
    // ========================================================================

    fn execute_seek(&mut self, pending: PendingSeek) {
        let ctx = self.ctx.clone();
        let previous = ctx.state();
        let _exec = ctx.seeks.lock_exec();
        ctx.set_state(PlaybackState::Seeking);
        self.pending = None;
        self.tracker.reset();
        self.second_field = None;
        self.clear_overlay();

        match seek::reposition(&ctx, &pending) {
            Ok(landed_ms) => {
                let floor = pending
                    .request
                    .accurate
                    .then_some(pending.request.target_ms * 1000);
                let outcome = self.buffer(BufferingReason::Seek, floor);
                let (result_ms, error) = match &outcome {
                    BufferingOutcome::Ready { anchor_us } => (anchor_us / 1000, None),
                    BufferingOutcome::Failed(err) => (landed_ms, Some(err.clone())),
                    _ => (landed_ms, None),
                };
                ctx.events.emit(PlaybackEvent::SeekCompleted {
                    id: pending.id,
                    result_ms,
                    error,
                });
                self.settle(BufferingReason::Seek, floor, outcome);
            }
            Err(err) => {
                ctx.events.emit(PlaybackEvent::SeekCompleted {
                    id: pending.id,
                    result_ms: ctx.position_ms(),
                    error: Some(err.clone()),
                });
                if err.is_terminal() {
                    ctx.terminate(Some(err));
                    return;
                }
                // Carry on from whatever is still queued
                ctx.decoder.start();
                ctx.set_state(previous);
            }
        }
    }

    // ========================================================================
    // Buffering
    // ========================================================================

    fn buffer(&mut self, reason: BufferingReason, floor_us: Option<i64>) -> BufferingOutcome {
        self.ctx.set_state(PlaybackState::Buffering);
        self.tracker.reset();
        self.second_field = None;
        self.buffering.run(reason, floor_us)
    }

    fn settle(&mut self, reason: BufferingReason, floor_us: Option<i64>, outcome: BufferingOutcome) {
        let ctx = self.ctx.clone();
        match outcome {
            BufferingOutcome::Ready { anchor_us } => {
                if !self.started {
                    tracing::info!("first frame ready at {} ms", anchor_us / 1000);
                }
                self.started = true;
                ctx.mark_started();
                self.reset_watchdog();
                // Pause requested while buffering: no frame may show first
                if !self.paused && ctx.is_pause_requested() {
                    self.apply_pause(true);
                }
                if self.paused {
                    ctx.set_state(PlaybackState::Paused);
                } else {
                    if !ctx.clock.is_running() {
                        ctx.clock.resume();
                    }
                    ctx.set_state(PlaybackState::Presenting);
                }
            }
            BufferingOutcome::Interrupted => {
                if !ctx.is_stop_requested() {
                    self.pending = Some((reason, floor_us));
                    if self.paused && !ctx.seeks.has_pending() {
                        ctx.sleep(ctx.poll_interval());
                    }
                }
            }
            BufferingOutcome::EndOfStream => {
                self.started = true;
                ctx.mark_started();
                self.enter_ended();
            }
            BufferingOutcome::Failed(err) => ctx.terminate(Some(err)),
        }
    }

    fn enter_ended(&mut self) {
        let ctx = &self.ctx;
        if ctx.state() == PlaybackState::Ended {
            return;
        }
        tracing::info!("end of stream at {} ms", ctx.position_ms());
        ctx.clock.pause();
        if self.overlay_until_us.take().is_some() {
            ctx.renderer.clear_overlay_texture();
        }
        ctx.set_state(PlaybackState::Ended);
        ctx.events.emit(PlaybackEvent::Ended);
    }

    // ========================================================================
    // Presenting
    // ========================================================================

    fn present(&mut self) {
        let ctx = self.ctx.clone();
        let policy = &ctx.config.policy;
        let direction = ctx.clock.direction();
        let mut wake_us = policy.max_sleep_us;
        let mut progressed = false;

        if ctx.latency_enabled() && !ctx.is_reverse_active() && self.regulate_latency() {
            return;
        }

        if let Some(video) = ctx.queue(StreamType::Video) {
            let step = if ctx.is_reverse_active() {
                self.reverse.present_video(&video, &mut self.tracker)
            } else {
                self.present_video(&video)
            };
            match step {
                FrameStep::Presented => {
                    progressed = true;
                    wake_us = 0;
                }
                FrameStep::Wait(us) => wake_us = wake_us.min(us),
                FrameStep::Rebuffer => {
                    tracing::debug!("video too far behind, rebuffering");
                    self.schedule(BufferingReason::Lag, None);
                    return;
                }
                FrameStep::Empty => {}
            }
        }

        let mut overlay_left_us = None;
        if !ctx.is_reverse_active() {
            overlay_left_us = self.expire_overlay();
            self.present_sideband(StreamType::Subtitle, &mut wake_us);
            self.present_sideband(StreamType::Data, &mut wake_us);
        }

        if self.check_drained(direction) || self.check_stall(progressed) {
            return;
        }
        let mut sleep_us = (wake_us - policy.sleep_margin_us).min(policy.max_sleep_us);
        // Overlay expiry is a deadline, not a presentation: no wake margin
        if let Some(left) = overlay_left_us {
            sleep_us = sleep_us.min(left);
        }
        ctx.sleep_us(sleep_us);
    }

    /// Clear a subtitle overlay whose display window has passed. Returns the
    /// time left on one still showing.
    fn expire_overlay(&mut self) -> Option<i64> {
        let until = self.overlay_until_us?;
        let elapsed = self.ctx.clock.elapsed_us();
        if elapsed >= until {
            self.ctx.renderer.clear_overlay_texture();
            self.overlay_until_us = None;
            return None;
        }
        let speed = self.ctx.clock.speed();
        Some(timeline_distance(until, elapsed, speed, Direction::Forward).max(1))
    }

    fn present_video(&mut self, video: &FrameQueue) -> FrameStep {
        let ctx = self.ctx.clone();
        let policy = &ctx.config.policy;
        let speed = ctx.clock.speed();
        let elapsed = ctx.clock.elapsed_us();

        if let Some(frame) = self.second_field.take() {
            let due = frame.pts_us + frame.duration_us / 2;
            let distance = timeline_distance(due, elapsed, speed, Direction::Forward);
            match classify(distance, StreamType::Video, policy) {
                SyncAction::Present => {
                    ctx.renderer.render_play(&frame, true);
                    ctx.stats.second_field();
                    return FrameStep::Presented;
                }
                SyncAction::Wait(us) => {
                    self.second_field = Some(frame);
                    return FrameStep::Wait(us);
                }
                // Field is stale; move on to the next frame
                SyncAction::Drop | SyncAction::Rebuffer => {}
            }
        }

        loop {
            let Some(head) = video.peek() else {
                return FrameStep::Empty;
            };
            if !self
                .tracker
                .accepts(StreamType::Video, head.pts_us, Direction::Forward)
            {
                video.try_dequeue();
                ctx.stats.out_of_order();
                ctx.stats.dropped(StreamType::Video, 1);
                continue;
            }

            let distance = timeline_distance(head.pts_us, elapsed, speed, Direction::Forward);
            match classify(distance, StreamType::Video, policy) {
                SyncAction::Present => {
                    let Some(frame) = video.try_dequeue() else {
                        return FrameStep::Empty;
                    };
                    if !ctx.renderer.render_play(&frame, false) {
                        tracing::warn!("renderer rejected frame at {} us", frame.pts_us);
                    }
                    ctx.stats.presented(StreamType::Video);
                    self.tracker.record(&frame, Direction::Forward);
                    if policy.double_rate && frame.interlaced {
                        self.second_field = Some(frame);
                    }
                    return FrameStep::Presented;
                }
                SyncAction::Drop => {
                    if let Some(frame) = video.try_dequeue() {
                        tracing::trace!("dropped late video frame {} ({} us)", frame.pts_us, distance);
                        ctx.stats.dropped(StreamType::Video, 1);
                        self.tracker.record(&frame, Direction::Forward);
                    }
                }
                SyncAction::Rebuffer => return FrameStep::Rebuffer,
                SyncAction::Wait(us) => return FrameStep::Wait(us),
            }
        }
    }

    fn present_sideband(&mut self, stream: StreamType, wake_us: &mut i64) {
        let ctx = self.ctx.clone();
        let Some(queue) = ctx.queue(stream) else {
            return;
        };
        let policy = &ctx.config.policy;
        let speed = ctx.clock.speed();
        let elapsed = ctx.clock.elapsed_us();

        while let Some(head) = queue.peek() {
            if !self.tracker.accepts(stream, head.pts_us, Direction::Forward) {
                queue.try_dequeue();
                ctx.stats.out_of_order();
                ctx.stats.dropped(stream, 1);
                continue;
            }
            let distance = timeline_distance(head.pts_us, elapsed, speed, Direction::Forward);
            match classify(distance, stream, policy) {
                SyncAction::Present => {
                    let Some(frame) = queue.try_dequeue() else {
                        break;
                    };
                    if stream == StreamType::Subtitle {
                        ctx.renderer.create_overlay_texture(&frame);
                        self.overlay_until_us = Some(frame.end_us());
                    } else {
                        ctx.renderer.present(&frame);
                    }
                    ctx.stats.presented(stream);
                    self.tracker.record(&frame, Direction::Forward);
                }
                SyncAction::Drop | SyncAction::Rebuffer => {
                    if let Some(frame) = queue.try_dequeue() {
                        tracing::trace!("dropped late {} frame {}", stream, frame.pts_us);
                        ctx.stats.dropped(stream, 1);
                        self.tracker.record(&frame, Direction::Forward);
                    }
                }
                SyncAction::Wait(us) => {
                    *wake_us = (*wake_us).min(us);
                    break;
                }
            }
        }
    }

    fn clear_overlay(&mut self) {
        if self.overlay_until_us.take().is_some() {
            self.ctx.renderer.clear_overlay_texture();
        }
    }

    /// Underrun and end-of-stream detection on the primary stream.
    fn check_drained(&mut self, direction: Direction) -> bool {
        let ctx = self.ctx.clone();
        let primary = ctx.primary_stream();
        let Some(queue) = ctx.queue(primary) else {
            return false;
        };
        if !queue.is_empty() || self.second_field.is_some() {
            return false;
        }
        let at_end = queue.is_eos() || ctx.decoder.status() == DecoderStatus::Ended;

        if primary == StreamType::Audio {
            let starved = ctx
                .audio_sink
                .as_ref()
                .map(|s| s.buffered_duration_us() < ctx.config.audio.low_watermark_us)
                .unwrap_or(true);
            if !starved {
                return false;
            }
            if at_end {
                self.enter_ended();
            } else {
                self.schedule(BufferingReason::Underrun, None);
            }
            return true;
        }

        let elapsed = ctx.clock.elapsed_us();
        let boundary = self.tracker.boundary_us().unwrap_or(elapsed);
        let tolerance = ctx.config.policy.eos_tolerance_us;
        let (passed, within_eos) = match direction {
            Direction::Forward => (elapsed >= boundary, elapsed >= boundary - tolerance),
            Direction::Reverse => (elapsed <= boundary, elapsed <= boundary + tolerance),
        };

        if at_end {
            if within_eos {
                self.enter_ended();
                return true;
            }
            false
        } else if passed {
            tracing::debug!("video queue ran dry at {} us", elapsed);
            self.schedule(BufferingReason::Underrun, None);
            true
        } else {
            false
        }
    }

    fn reset_watchdog(&mut self) {
        self.watchdog = Watchdog {
            elapsed_us: self.ctx.clock.elapsed_us(),
            since_us: self.ctx.time.now_us(),
        };
    }

    /// Raise `UnexpectedStop` when nothing moves while presenting.
    fn check_stall(&mut self, progressed: bool) -> bool {
        let elapsed = self.ctx.clock.elapsed_us();
        let now = self.ctx.time.now_us();
        if progressed || elapsed != self.watchdog.elapsed_us {
            self.watchdog = Watchdog {
                elapsed_us: elapsed,
                since_us: now,
            };
            return false;
        }
        let stalled_us = now - self.watchdog.since_us;
        if stalled_us >= self.ctx.config.policy.stall_timeout_ms as i64 * 1000 {
            tracing::error!(
                "no progress for {} ms at {} us",
                stalled_us / 1000,
                elapsed
            );
            self.ctx.terminate(Some(PlaybackError::UnexpectedStop));
            return true;
        }
        false
    }

    // ========================================================================
    // Latency
    // ========================================================================

    /// Returns true when a flush was issued.
    fn regulate_latency(&mut self) -> bool {
        let ctx = self.ctx.clone();
        let sample = LatencySample::measure(&ctx);
        match self.latency.evaluate(&sample) {
            LatencyAction::Hold => false,
            LatencyAction::SetSpeed(speed) => {
                tracing::debug!(
                    "latency {} ms, speed -> {:.1}x",
                    sample.buffered_us / 1000,
                    speed
                );
                self.apply_speed(speed);
                false
            }
            LatencyAction::Flush => {
                tracing::info!(
                    "latency {} ms beyond catch-up range, flushing",
                    sample.buffered_us / 1000
                );
                ctx.decoder.flush();
                ctx.clear_queues(ctx.clock.direction());
                self.apply_speed(1.0);
                self.latency.reset();
                ctx.stats.latency_flush();
                self.schedule(BufferingReason::LatencyFlush, None);
                true
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
