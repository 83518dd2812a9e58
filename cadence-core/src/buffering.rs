//! # Buffering Controller
//!
//! Brings the queues back to a playable state after an underrun, seek,
//! stream switch or latency flush, then rebases the clock onto the anchor
//! frame.
//!
//! Episodes are tracked by a started/completed counter pair:
//! `completed == started - 1` while buffering, `completed == started` once
//! settled. Only the caller that moves `started` fires `BufferingStarted`,
//! so concurrent triggers collapse into one episode.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::context::PlaybackContext;
use crate::decode::DecoderStatus;
use crate::error::PlaybackError;
use crate::events::PlaybackEvent;
use crate::frame_queue::{FrameQueue, StreamType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferingState {
    Idle,
    Buffering,
    Ready,
}

/// Why an episode started (for logs)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferingReason {
    Initial,
    Underrun,
    Lag,
    Seek,
    StreamSwitch,
    LatencyFlush,
    DirectionChange,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BufferingOutcome {
    /// Clock rebased onto this anchor
    Ready { anchor_us: i64 },
    /// A newer seek or stop arrived; nothing was rebased
    Interrupted,
    /// Decoder hit end of input with nothing left to show
    EndOfStream,
    Failed(PlaybackError),
}

// ============================================================================
// Episode Counters
// ============================================================================

pub struct BufferingCounters {
    started: AtomicU64,
    completed: AtomicU64,
}

impl BufferingCounters {
    pub fn new() -> Self {
        Self {
            started: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    /// Open an episode. Returns false when one is already open.
    pub fn try_begin(&self) -> bool {
        let completed = self.completed.load(Ordering::SeqCst);
        self.started
            .compare_exchange(completed, completed + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Close the open episode. Returns false when none is open.
    pub fn complete(&self) -> bool {
        let started = self.started.load(Ordering::SeqCst);
        if started == 0 {
            return false;
        }
        self.completed
            .compare_exchange(started - 1, started, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn state(&self) -> BufferingState {
        let started = self.started.load(Ordering::SeqCst);
        let completed = self.completed.load(Ordering::SeqCst);
        if started == completed {
            if started == 0 {
                BufferingState::Idle
            } else {
                BufferingState::Ready
            }
        } else {
            BufferingState::Buffering
        }
    }

    pub fn started(&self) -> u64 {
        self.started.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }
}

impl Default for BufferingCounters {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Controller
// ============================================================================

pub struct BufferingController {
    ctx: Arc<PlaybackContext>,
}

impl BufferingController {
    pub fn new(ctx: Arc<PlaybackContext>) -> Self {
        Self { ctx }
    }

    /// Fire `BufferingStarted` if this call opened the episode.
    pub fn begin(&self) -> bool {
        let opened = self.ctx.buffering.try_begin();
        if opened {
            self.ctx.stats.rebuffer();
            self.ctx.events.emit(PlaybackEvent::BufferingStarted);
        }
        opened
    }

    /// Fire `BufferingCompleted` if this call closed the episode.
    pub fn finish(&self, error: Option<PlaybackError>) -> bool {
        let closed = self.ctx.buffering.complete();
        if closed {
            self.ctx
                .events
                .emit(PlaybackEvent::BufferingCompleted { error });
        }
        closed
    }

    /// Run one buffering episode. `floor_us` drops primary frames before an
    /// accurate seek target.
    pub fn run(&self, reason: BufferingReason, floor_us: Option<i64>) -> BufferingOutcome {
        let opened = self.begin();
        if !opened {
            tracing::debug!("buffering already open, joining episode ({:?})", reason);
        }
        tracing::debug!("buffering started ({:?})", reason);

        let outcome = self.fill(floor_us);
        let error = match &outcome {
            BufferingOutcome::Ready { anchor_us } => {
                tracing::debug!("buffering ready, anchor {} us", anchor_us);
                None
            }
            BufferingOutcome::Failed(err) => Some(err.clone()),
            BufferingOutcome::Interrupted => {
                tracing::debug!("buffering interrupted");
                None
            }
            BufferingOutcome::EndOfStream => {
                tracing::debug!("buffering reached end of stream");
                None
            }
        };
        // The episode belongs to whoever opened it
        if opened {
            self.finish(error);
        }
        outcome
    }

    fn fill(&self, floor_us: Option<i64>) -> BufferingOutcome {
        let ctx = &self.ctx;
        let poll = ctx.poll_interval();
        let deadline = ctx.time.now_us() + ctx.config.buffering.timeout_ms as i64 * 1000;

        ctx.decoder.start();

        let primary = ctx.primary_stream();
        let Some(primary_q) = ctx.queue(primary) else {
            return BufferingOutcome::Failed(PlaybackError::BufferingFailed);
        };

        // Primary stream must deliver a frame
        loop {
            if ctx.should_interrupt() {
                return BufferingOutcome::Interrupted;
            }
            if let Some(floor) = floor_us {
                primary_q.discard_before(floor);
            }
            if !primary_q.is_empty() {
                break;
            }
            if primary_q.is_eos() || ctx.decoder.status() == DecoderStatus::Ended {
                return BufferingOutcome::EndOfStream;
            }
            if ctx.time.now_us() >= deadline {
                tracing::warn!("{} stream exhausted while buffering", primary);
                return BufferingOutcome::Failed(PlaybackError::Exhausted(primary));
            }
            ctx.sleep(poll);
        }

        // Companion gets a bounded retry budget
        if primary == StreamType::Video && ctx.audio_enabled() && !ctx.is_reverse_active() {
            if let Some(audio_q) = ctx.queue(StreamType::Audio) {
                if !self.wait_companion(&audio_q) {
                    return BufferingOutcome::Interrupted;
                }
            }
        }

        let Some(anchor) = primary_q.peek() else {
            return BufferingOutcome::Failed(PlaybackError::BufferingFailed);
        };
        let anchor_us = anchor.pts_us;
        self.trim_to_anchor(primary, anchor_us);

        // Optional pre-roll
        let min_us = ctx.config.buffering.min_buffer_duration_ms as i64 * 1000;
        if min_us > 0 {
            loop {
                if ctx.should_interrupt() {
                    return BufferingOutcome::Interrupted;
                }
                if primary_q.buffered_duration_us() >= min_us
                    || primary_q.is_full()
                    || primary_q.is_eos()
                    || ctx.decoder.status() == DecoderStatus::Ended
                {
                    break;
                }
                if ctx.time.now_us() >= deadline {
                    tracing::debug!(
                        "pre-roll stopped at {} us of {} us",
                        primary_q.buffered_duration_us(),
                        min_us
                    );
                    break;
                }
                ctx.sleep(poll);
            }
        }

        if ctx.decoder.requires_resync() {
            ctx.decoder.resync(anchor_us);
        }
        ctx.clock.rebase(anchor_us, ctx.clock.speed());
        BufferingOutcome::Ready { anchor_us }
    }

    /// Returns false if interrupted.
    fn wait_companion(&self, audio_q: &FrameQueue) -> bool {
        let ctx = &self.ctx;
        let budget = ctx.config.buffering.companion_retry_budget;
        let mut retries = 0;
        while audio_q.is_empty() && !audio_q.is_eos() {
            if ctx.should_interrupt() {
                return false;
            }
            if ctx.decoder.status() == DecoderStatus::Ended {
                break;
            }
            if retries >= budget {
                tracing::warn!(
                    "audio stream exhausted after {} retries, continuing video-only",
                    retries
                );
                ctx.stats.audio_exhausted();
                break;
            }
            retries += 1;
            ctx.sleep(ctx.poll_interval());
        }
        true
    }

    /// Drop companion frames that would play stale against the anchor.
    fn trim_to_anchor(&self, primary: StreamType, anchor_us: i64) {
        let ctx = &self.ctx;
        if primary == StreamType::Video {
            if let Some(audio_q) = ctx.queue(StreamType::Audio) {
                let dropped = if ctx.is_reverse_active() {
                    audio_q.clear()
                } else {
                    let delay = ctx
                        .audio_sink
                        .as_ref()
                        .map(|s| s.device_delay_us())
                        .unwrap_or(0);
                    audio_q.discard_before(anchor_us - delay)
                };
                if dropped > 0 {
                    ctx.stats.dropped(StreamType::Audio, dropped as u64);
                    tracing::debug!("discarded {} stale audio frames", dropped);
                }
            }
        }
        for stream in [StreamType::Subtitle, StreamType::Data] {
            if let Some(q) = ctx.queue(stream) {
                let dropped = if ctx.is_reverse_active() {
                    q.clear()
                } else {
                    q.discard_ended_before(anchor_us)
                };
                if dropped > 0 {
                    ctx.stats.dropped(stream, dropped as u64);
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SimulatedAudioSink;
    use crate::clock::{ManualTimeSource, SystemTimeSource};
    use crate::config::SyncConfig;
    use crate::decode::Decoder;
    use crate::render::RecordingRenderer;
    use crate::synthetic::{SyntheticDecoder, SyntheticSource};
    use std::thread;
    use std::time::{Duration, Instant};

    fn context(source: SyntheticSource, config: SyncConfig) -> (Arc<PlaybackContext>, Arc<SyntheticDecoder>) {
        let time = Arc::new(ManualTimeSource::new());
        let decoder = Arc::new(SyntheticDecoder::new(source));
        let sink = Arc::new(SimulatedAudioSink::new(time.clone(), 30_000));
        let ctx = Arc::new(PlaybackContext::new(
            config,
            time,
            decoder.clone(),
            Arc::new(RecordingRenderer::new()),
            Some(sink),
        ));
        (ctx, decoder)
    }

    #[test]
    fn counters_track_episode() {
        let counters = BufferingCounters::new();
        assert_eq!(counters.state(), BufferingState::Idle);
        assert!(counters.try_begin());
        assert!(!counters.try_begin());
        assert_eq!(counters.state(), BufferingState::Buffering);
        assert_eq!(counters.completed(), counters.started() - 1);
        assert!(counters.complete());
        assert!(!counters.complete());
        assert_eq!(counters.state(), BufferingState::Ready);
    }

    #[test]
    fn concurrent_triggers_pair_events() {
        let (ctx, _decoder) = context(SyntheticSource::default(), SyncConfig::default());
        let events = ctx.events.subscribe();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ctx = ctx.clone();
                thread::spawn(move || {
                    let controller = BufferingController::new(ctx.clone());
                    for _ in 0..200 {
                        if controller.begin() {
                            let started = ctx.buffering.started();
                            let completed = ctx.buffering.completed();
                            assert_eq!(completed + 1, started);
                            assert!(controller.finish(None));
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut started = 0;
        let mut completed = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                PlaybackEvent::BufferingStarted => started += 1,
                PlaybackEvent::BufferingCompleted { .. } => completed += 1,
                _ => {}
            }
        }
        assert!(started > 0);
        assert_eq!(started, completed);
        assert_eq!(ctx.buffering.started(), ctx.buffering.completed());
    }

    #[test]
    fn anchors_on_first_video_frame_and_trims_audio() {
        let source = SyntheticSource {
            duration_us: 2_000_000,
            ..SyntheticSource::default()
        };
        let (ctx, decoder) = context(source, SyncConfig::default());
        decoder.seek(1_000, false, false).expect("seek");

        // Audio that starts well before the video anchor
        let audio = decoder.queue(StreamType::Audio).unwrap();
        audio.clear();
        audio.mark_resync(crate::clock::Direction::Forward);
        for i in 0..10 {
            audio.enqueue(crate::frame_queue::Frame::new(
                StreamType::Audio,
                800_000 + i * 20_000,
                20_000,
                bytes::Bytes::new(),
            ));
        }

        let controller = BufferingController::new(ctx.clone());
        let outcome = controller.run(BufferingReason::Seek, None);
        assert_eq!(outcome, BufferingOutcome::Ready { anchor_us: 1_000_000 });
        assert_eq!(ctx.clock.elapsed_us(), 1_000_000);
        // device delay 30ms: frames before 970ms are stale
        let head = audio.peek().expect("audio left");
        assert!(head.pts_us >= 970_000, "head {}", head.pts_us);
        assert_eq!(ctx.buffering.started(), ctx.buffering.completed());
    }

    #[test]
    fn proceeds_without_audio_after_budget() {
        let source = SyntheticSource {
            audio_frame_us: 20_000,
            audio_stalled: true,
            ..SyntheticSource::default()
        };
        let (ctx, _decoder) = context(source, SyncConfig::default());
        let controller = BufferingController::new(ctx.clone());
        let outcome = controller.run(BufferingReason::Initial, None);
        assert_eq!(outcome, BufferingOutcome::Ready { anchor_us: 0 });
        assert_eq!(ctx.stats_snapshot().audio_exhausted, 1);
    }

    #[test]
    fn stalled_video_reports_exhausted() {
        let source = SyntheticSource {
            video_stalled: true,
            ..SyntheticSource::default()
        };
        let mut config = SyncConfig::default();
        config.buffering.timeout_ms = 100;
        let (ctx, _decoder) = context(source, config);
        let events = ctx.events.subscribe();
        let controller = BufferingController::new(ctx.clone());
        let outcome = controller.run(BufferingReason::Initial, None);
        assert_eq!(
            outcome,
            BufferingOutcome::Failed(PlaybackError::Exhausted(StreamType::Video))
        );
        let completed: Vec<_> = events
            .try_iter()
            .filter(|e| matches!(e, PlaybackEvent::BufferingCompleted { .. }))
            .collect();
        assert_eq!(
            completed,
            vec![PlaybackEvent::BufferingCompleted {
                error: Some(PlaybackError::Exhausted(StreamType::Video))
            }]
        );
    }

    #[test]
    fn end_of_input_is_not_an_error() {
        let source = SyntheticSource {
            duration_us: 100_000,
            ..SyntheticSource::default()
        };
        let (ctx, decoder) = context(source, SyncConfig::default());
        decoder.start();
        let video = decoder.queue(StreamType::Video).unwrap();
        while video.try_dequeue().is_some() {}
        assert!(video.is_eos());

        let events = ctx.events.subscribe();
        let controller = BufferingController::new(ctx);
        assert_eq!(
            controller.run(BufferingReason::Underrun, None),
            BufferingOutcome::EndOfStream
        );
        let completed: Vec<_> = events
            .try_iter()
            .filter(|e| matches!(e, PlaybackEvent::BufferingCompleted { .. }))
            .collect();
        assert_eq!(completed, vec![PlaybackEvent::BufferingCompleted { error: None }]);
    }

    #[test]
    fn pending_seek_interrupts_primary_wait() {
        let source = SyntheticSource {
            video_stalled: true,
            ..SyntheticSource::default()
        };
        let (ctx, _decoder) = context(source, SyncConfig::default());
        ctx.seeks.push(crate::seek::SeekRequest::new(500));
        let controller = BufferingController::new(ctx);
        assert_eq!(
            controller.run(BufferingReason::Underrun, None),
            BufferingOutcome::Interrupted
        );
    }

    /// Live source paced in real time, so pre-roll has to wait for frames
    fn live_context(config: SyncConfig) -> (Arc<PlaybackContext>, Arc<SyntheticDecoder>) {
        let time = Arc::new(SystemTimeSource::new());
        let source = SyntheticSource {
            live: true,
            ..SyntheticSource::default()
        };
        let decoder = SyntheticDecoder::spawn(source, time.clone());
        let ctx = Arc::new(PlaybackContext::new(
            config,
            time,
            decoder.clone(),
            Arc::new(RecordingRenderer::new()),
            None,
        ));
        (ctx, decoder)
    }

    #[test]
    fn preroll_waits_for_min_buffer_duration() {
        let mut config = SyncConfig::default();
        config.buffering.min_buffer_duration_ms = 200;
        let (ctx, decoder) = live_context(config);
        let started = Instant::now();

        let controller = BufferingController::new(ctx.clone());
        let outcome = controller.run(BufferingReason::Initial, None);
        decoder.shutdown();

        assert_eq!(outcome, BufferingOutcome::Ready { anchor_us: 0 });
        let video = decoder.queue(StreamType::Video).unwrap();
        assert!(video.buffered_duration_us() >= 200_000);
        // frames up to 160ms only exist once 160ms of wall time passed
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(ctx.clock.elapsed_us(), 0);
    }

    #[test]
    fn pending_seek_cancels_preroll() {
        let mut config = SyncConfig::default();
        config.buffering.min_buffer_duration_ms = 3_000;
        let (ctx, decoder) = live_context(config);
        let seeker = {
            let ctx = ctx.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                ctx.seeks.push(crate::seek::SeekRequest::new(1_000));
                ctx.wakeup.notify();
            })
        };
        let started = Instant::now();

        let controller = BufferingController::new(ctx.clone());
        let outcome = controller.run(BufferingReason::Initial, None);
        decoder.shutdown();
        seeker.join().unwrap();

        assert_eq!(outcome, BufferingOutcome::Interrupted);
        assert!(started.elapsed() < Duration::from_millis(2_000));
        assert_eq!(ctx.buffering.started(), ctx.buffering.completed());
    }

    #[test]
    fn joining_run_leaves_episode_to_opener() {
        let (ctx, _decoder) = context(SyntheticSource::default(), SyncConfig::default());
        let events = ctx.events.subscribe();
        let opener = BufferingController::new(ctx.clone());
        assert!(opener.begin());

        let joiner = BufferingController::new(ctx.clone());
        let outcome = joiner.run(BufferingReason::Underrun, None);
        assert_eq!(outcome, BufferingOutcome::Ready { anchor_us: 0 });
        assert_eq!(ctx.buffering.state(), BufferingState::Buffering);
        assert_eq!(ctx.buffering.completed() + 1, ctx.buffering.started());

        assert!(opener.finish(None));
        assert_eq!(ctx.buffering.state(), BufferingState::Ready);
        let completed = events
            .try_iter()
            .filter(|e| matches!(e, PlaybackEvent::BufferingCompleted { .. }))
            .count();
        assert_eq!(completed, 1);
    }

    #[test]
    fn accurate_floor_skips_early_frames() {
        let (ctx, decoder) = context(SyntheticSource::default(), SyncConfig::default());
        decoder.seek(1_010, false, true).expect("seek");
        let controller = BufferingController::new(ctx);
        match controller.run(BufferingReason::Seek, Some(1_010_000)) {
            BufferingOutcome::Ready { anchor_us } => assert!(anchor_us >= 1_010_000),
            other => panic!("unexpected {:?}", other),
        }
    }
}
