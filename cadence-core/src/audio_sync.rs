//! # Audio Synchronizer
//!
//! Feeds the audio sink on its own cadence so the device never starves when
//! the video path stalls. Shares the playback clock with video.
//!
//! ```text
//!            generation change / starvation / desync
//!   Feeding ------------------------------------------> Resync
//!      ^                                                  |
//!      |   wait = pts - elapsed - device_delay            |
//!      |   |wait| <= tolerance and lookahead available    |
//!      +--------------------------------------------------+
//! ```
//!
//! While feeding, the sink is topped up to `max_play_buffer` and then left
//! to drain down to `min_play_buffer` before the next top-up.

use std::sync::Arc;
use std::time::Duration;

use crate::audio::AudioSink;
use crate::context::PlaybackContext;
use crate::frame_queue::{FrameQueue, StreamType};
use crate::sync::PlaybackState;

/// What one audio iteration did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioStep {
    /// Audio is not playing
    Idle,
    /// Nothing to do for this many microseconds
    Waiting(i64),
    /// Late frames discarded while resyncing
    Dropped(usize),
    /// Sink cleared and realigned to the clock
    Resynced,
    Fed(usize),
    /// Timestamps drifted beyond the desync bound; resync next
    Desynced,
    /// Sink above its watermark
    Saturated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Resync,
    Feeding,
}

pub struct AudioSynchronizer {
    ctx: Arc<PlaybackContext>,
    mode: Mode,
    seen_generation: Option<u64>,
    /// Where the next contiguous frame should start
    expected_next_us: Option<i64>,
    last_fed_us: Option<i64>,
    desync_us: i64,
    /// Between the min and max watermark: still topping up
    filling: bool,
}

impl AudioSynchronizer {
    pub fn new(ctx: Arc<PlaybackContext>) -> Self {
        Self {
            ctx,
            mode: Mode::Resync,
            seen_generation: None,
            expected_next_us: None,
            last_fed_us: None,
            desync_us: 0,
            filling: true,
        }
    }

    pub fn run(mut self) {
        tracing::info!("audio synchronizer started");
        let poll = Duration::from_millis(self.ctx.config.audio.poll_interval_ms);
        while !self.ctx.is_stop_requested() {
            match self.step() {
                AudioStep::Waiting(us) => {
                    let us = us.clamp(0, poll.as_micros() as i64);
                    self.ctx.sleep(Duration::from_micros(us as u64));
                }
                AudioStep::Dropped(_) | AudioStep::Resynced | AudioStep::Desynced => {}
                AudioStep::Idle | AudioStep::Fed(_) | AudioStep::Saturated => self.ctx.sleep(poll),
            }
        }
        tracing::info!("audio synchronizer exited");
    }

    fn active(&self) -> bool {
        let ctx = &self.ctx;
        ctx.audio_enabled()
            && ctx.state() == PlaybackState::Presenting
            && !ctx.is_reverse_active()
            && !ctx.is_pause_requested()
            && ctx.clock.is_running()
    }

    fn enter_resync(&mut self) {
        self.mode = Mode::Resync;
        self.expected_next_us = None;
        self.last_fed_us = None;
        self.desync_us = 0;
    }

    pub fn step(&mut self) -> AudioStep {
        let ctx = self.ctx.clone();
        let (Some(sink), Some(queue)) = (ctx.audio_sink.clone(), ctx.queue(StreamType::Audio)) else {
            return AudioStep::Idle;
        };
        if !self.active() {
            if self.mode == Mode::Feeding {
                self.enter_resync();
            }
            return AudioStep::Idle;
        }

        let generation = ctx.clock.generation();
        if self.seen_generation != Some(generation) {
            self.seen_generation = Some(generation);
            if self.mode == Mode::Feeding {
                tracing::debug!("clock rebased, audio resync");
            }
            self.enter_resync();
        }

        match self.mode {
            Mode::Resync => self.resync(sink.as_ref(), &queue),
            Mode::Feeding => self.feed(sink.as_ref(), &queue),
        }
    }

    fn resync(&mut self, sink: &dyn AudioSink, queue: &FrameQueue) -> AudioStep {
        let ctx = &self.ctx;
        let audio = &ctx.config.audio;
        let poll_us = audio.poll_interval_ms as i64 * 1000;
        let speed = ctx.clock.speed();
        let delay = sink.device_delay_us();
        let mut dropped = 0;

        loop {
            let Some(head) = queue.peek() else {
                return if dropped > 0 {
                    AudioStep::Dropped(dropped)
                } else {
                    AudioStep::Waiting(poll_us)
                };
            };
            let elapsed = ctx.clock.elapsed_us();
            let wait = ((head.pts_us - elapsed - delay) as f64 / speed) as i64;
            if wait > audio.resync_tolerance_us {
                return AudioStep::Waiting(wait - audio.resync_tolerance_us / 2);
            }
            if wait < -audio.resync_tolerance_us {
                queue.try_dequeue();
                ctx.stats.dropped(StreamType::Audio, 1);
                dropped += 1;
                continue;
            }
            break;
        }

        let lookahead = queue.buffered_duration_us();
        if lookahead < audio.min_lookahead_us && !queue.is_full() && !queue.is_eos() {
            return if dropped > 0 {
                AudioStep::Dropped(dropped)
            } else {
                AudioStep::Waiting(poll_us)
            };
        }

        sink.clear_buffer();
        ctx.stats.audio_resync();
        self.mode = Mode::Feeding;
        self.filling = true;
        tracing::debug!(
            "audio resynced at {} us ({} late frames dropped)",
            ctx.clock.elapsed_us(),
            dropped
        );
        AudioStep::Resynced
    }

    fn feed(&mut self, sink: &dyn AudioSink, queue: &FrameQueue) -> AudioStep {
        let ctx = &self.ctx;
        let audio = &ctx.config.audio;
        let buffered = sink.buffered_duration_us();

        if self.expected_next_us.is_some() && buffered < audio.low_watermark_us {
            tracing::debug!("audio sink starved ({} us), resyncing", buffered);
            self.enter_resync();
            return AudioStep::Waiting(0);
        }
        if buffered >= audio.max_play_buffer_us {
            self.filling = false;
        }
        if !self.filling && buffered > audio.min_play_buffer_us {
            return AudioStep::Saturated;
        }
        self.filling = true;

        let mut fed = 0;
        while sink.buffered_duration_us() < audio.max_play_buffer_us {
            let Some(head) = queue.peek() else {
                break;
            };
            if self.last_fed_us.is_some_and(|last| head.pts_us < last) {
                queue.try_dequeue();
                ctx.stats.out_of_order();
                ctx.stats.dropped(StreamType::Audio, 1);
                continue;
            }
            if let Some(expected) = self.expected_next_us {
                self.desync_us += (head.pts_us - expected).abs();
                if self.desync_us > audio.max_desync_us {
                    tracing::debug!(
                        "audio desync {} us at {} us, resyncing",
                        self.desync_us,
                        head.pts_us
                    );
                    ctx.stats.audio_desync();
                    self.enter_resync();
                    return AudioStep::Desynced;
                }
            }
            let Some(frame) = queue.try_dequeue() else {
                break;
            };
            self.expected_next_us = Some(frame.end_us());
            self.last_fed_us = Some(frame.pts_us);
            sink.add_samples(frame);
            ctx.stats.presented(StreamType::Audio);
            fed += 1;
        }

        if fed > 0 {
            AudioStep::Fed(fed)
        } else {
            AudioStep::Waiting(audio.poll_interval_ms as i64 * 1000)
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
    use crate::clock::ManualTimeSource;
    use crate::config::SyncConfig;
    use crate::decode::Decoder;
    use crate::render::RecordingRenderer;
    use crate::synthetic::{SyntheticDecoder, SyntheticSource};

    fn audio_only(
        source: SyntheticSource,
    ) -> (Arc<PlaybackContext>, Arc<ManualTimeSource>, Arc<SimulatedAudioSink>) {
        let time = Arc::new(ManualTimeSource::new());
        let decoder = Arc::new(SyntheticDecoder::new(SyntheticSource {
            video_fps: 0.0,
            ..source
        }));
        let sink = Arc::new(SimulatedAudioSink::new(time.clone(), 20_000));
        let ctx = Arc::new(PlaybackContext::new(
            SyncConfig::default(),
            time.clone(),
            decoder.clone(),
            Arc::new(RecordingRenderer::new()),
            Some(sink.clone()),
        ));
        decoder.start();
        ctx.clock.start(0);
        ctx.set_state(PlaybackState::Presenting);
        (ctx, time, sink)
    }

    #[test]
    fn idle_unless_presenting() {
        let (ctx, _time, _sink) = audio_only(SyntheticSource::default());
        ctx.set_state(PlaybackState::Paused);
        let mut audio = AudioSynchronizer::new(ctx.clone());
        assert_eq!(audio.step(), AudioStep::Idle);

        ctx.set_state(PlaybackState::Presenting);
        ctx.set_reverse_active(true);
        assert_eq!(audio.step(), AudioStep::Idle);
    }

    #[test]
    fn resync_drops_late_frames() {
        let (ctx, time, _sink) = audio_only(SyntheticSource::default());
        time.advance(100_000);
        let mut audio = AudioSynchronizer::new(ctx.clone());
        // elapsed 100ms, delay 20ms: frames before ~80ms are late
        match audio.step() {
            AudioStep::Dropped(n) => assert!(n >= 4, "dropped {}", n),
            AudioStep::Resynced => {}
            other => panic!("unexpected {:?}", other),
        }
        assert!(ctx.stats_snapshot().audio.dropped >= 4);
    }

    #[test]
    fn gap_triggers_exactly_one_resync() {
        let (ctx, time, sink) = audio_only(SyntheticSource {
            audio_gaps: vec![(100_000, 60_000)],
            ..SyntheticSource::default()
        });
        let mut audio = AudioSynchronizer::new(ctx.clone());
        let mut desynced = 0;
        for _ in 0..120 {
            if audio.step() == AudioStep::Desynced {
                desynced += 1;
            }
            time.advance(5_000);
        }

        let fed = sink.fed_timestamps();
        let before_gap = fed.iter().position(|&pts| pts == 80_000).expect("fed before gap");
        let after_gap = fed.iter().position(|&pts| pts == 160_000).expect("fed after gap");
        assert_eq!(after_gap, before_gap + 1);
        assert_eq!(desynced, 1);
        let stats = ctx.stats_snapshot();
        // one initial alignment, one after the gap
        assert_eq!(stats.audio_resyncs, 2);
        assert_eq!(stats.audio_desyncs, 1);
    }

    #[test]
    fn watermarks_bound_the_sink() {
        let (ctx, time, sink) = audio_only(SyntheticSource::default());
        let mut audio = AudioSynchronizer::new(ctx.clone());
        let max = ctx.config.audio.max_play_buffer_us;
        let frame = 20_000;
        for _ in 0..200 {
            audio.step();
            assert!(sink.buffered_duration_us() < max + frame);
            time.advance(5_000);
        }
        // never starved, so never realigned after the first time
        assert_eq!(ctx.stats_snapshot().audio_resyncs, 1);
    }

    #[test]
    fn rebase_forces_resync() {
        let (ctx, time, _sink) = audio_only(SyntheticSource::default());
        let mut audio = AudioSynchronizer::new(ctx.clone());
        for _ in 0..10 {
            audio.step();
            time.advance(5_000);
        }
        let before = ctx.stats_snapshot().audio_resyncs;
        ctx.clock.rebase(ctx.clock.elapsed_us(), 1.0);
        for _ in 0..60 {
            audio.step();
            time.advance(5_000);
        }
        assert_eq!(ctx.stats_snapshot().audio_resyncs, before + 1);
    }
}
