//! # Latency Controller
//!
//! Live and low-latency profiles keep the buffered duration inside
//! `[min_latency, max_latency]` by adjusting playback speed rather than
//! stuttering:
//!
//! ```text
//!   buffered > max     speed = max(ceil(buffered / max, 0.1), 1.1)
//!   speed > cap        hard flush + rebuffer
//!   buffered <= min    speed = 1.0
//! ```
//!
//! Speed changes are rate-limited so the audible pitch does not oscillate.

use crate::clock::MAX_SPEED;
use crate::config::LatencyConfig;
use crate::context::PlaybackContext;
use crate::frame_queue::StreamType;

/// One measurement of how far behind the live edge playback sits
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySample {
    pub buffered_us: i64,
    pub speed: f64,
    /// Wall time of the measurement
    pub at_us: i64,
    pub video_frames: usize,
    pub packets: usize,
}

impl LatencySample {
    pub fn measure(ctx: &PlaybackContext) -> Self {
        let queued = |s: StreamType| {
            ctx.queue(s)
                .map(|q| (q.buffered_duration_us(), q.len()))
                .unwrap_or((0, 0))
        };
        let (video_us, video_frames) = queued(StreamType::Video);
        let (audio_us, _) = queued(StreamType::Audio);
        Self {
            buffered_us: video_us.max(audio_us) + ctx.decoder.demuxed_duration_us(),
            speed: ctx.clock.speed(),
            at_us: ctx.time.now_us(),
            video_frames,
            packets: ctx.decoder.queued_packets(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LatencyAction {
    Hold,
    SetSpeed(f64),
    /// Speed alone can no longer catch up; discard and rebuffer
    Flush,
}

pub struct LatencyController {
    config: LatencyConfig,
    last_change_us: Option<i64>,
}

impl LatencyController {
    pub fn new(config: LatencyConfig) -> Self {
        Self {
            config,
            last_change_us: None,
        }
    }

    /// Catch-up speed for a buffered duration, before capping.
    pub fn target_speed(buffered_us: i64, max_latency_us: i64) -> f64 {
        if max_latency_us <= 0 {
            return MAX_SPEED;
        }
        let ratio = buffered_us as f64 / max_latency_us as f64;
        let rounded = (ratio * 10.0).ceil() / 10.0;
        rounded.max(1.1)
    }

    fn cap(&self) -> f64 {
        self.config.max_speed.clamp(1.0, MAX_SPEED)
    }

    fn may_change(&self, at_us: i64) -> bool {
        match self.last_change_us {
            None => true,
            Some(last) => at_us - last >= self.config.speed_change_interval_ms as i64 * 1000,
        }
    }

    pub fn evaluate(&mut self, sample: &LatencySample) -> LatencyAction {
        let max_frames = self.config.max_video_frames;
        let max_packets = self.config.max_packets;
        if (max_frames > 0 && sample.video_frames > max_frames)
            || (max_packets > 0 && sample.packets > max_packets)
        {
            tracing::debug!(
                "low-latency limit exceeded ({} frames, {} packets)",
                sample.video_frames,
                sample.packets
            );
            return LatencyAction::Flush;
        }

        let max_us = self.config.max_latency_ms as i64 * 1000;
        let min_us = self.config.min_latency_ms as i64 * 1000;

        if sample.buffered_us > max_us {
            let target = Self::target_speed(sample.buffered_us, max_us);
            if target > self.cap() {
                tracing::debug!(
                    "latency {} ms needs {:.1}x, above cap {:.1}x",
                    sample.buffered_us / 1000,
                    target,
                    self.cap()
                );
                return LatencyAction::Flush;
            }
            if (target - sample.speed).abs() < 0.05 || !self.may_change(sample.at_us) {
                return LatencyAction::Hold;
            }
            self.last_change_us = Some(sample.at_us);
            return LatencyAction::SetSpeed(target);
        }

        if sample.buffered_us <= min_us && sample.speed != 1.0 {
            if !self.may_change(sample.at_us) {
                return LatencyAction::Hold;
            }
            self.last_change_us = Some(sample.at_us);
            return LatencyAction::SetSpeed(1.0);
        }

        LatencyAction::Hold
    }

    /// Forget rate-limit history after a flush.
    pub fn reset(&mut self) {
        self.last_change_us = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(buffered_ms: i64, speed: f64, at_ms: i64) -> LatencySample {
        LatencySample {
            buffered_us: buffered_ms * 1000,
            speed,
            at_us: at_ms * 1000,
            video_frames: 0,
            packets: 0,
        }
    }

    #[test]
    fn test_target_speed_rounding() {
        assert_eq!(LatencyController::target_speed(310_000, 300_000), 1.1);
        assert_eq!(LatencyController::target_speed(400_000, 300_000), 1.4);
        assert_eq!(LatencyController::target_speed(900_000, 300_000), 3.0);
    }

    #[test]
    fn test_speeds_stay_in_bounds() {
        let mut ctl = LatencyController::new(LatencyConfig::default());
        let mut speed = 1.0;
        for (i, buffered) in [50, 350, 800, 1_150, 1_300, 2_000, 90, 600].iter().enumerate() {
            match ctl.evaluate(&sample(*buffered, speed, i as i64 * 2_000)) {
                LatencyAction::SetSpeed(s) => {
                    assert!((1.0..=4.0).contains(&s), "speed {}", s);
                    speed = s;
                }
                LatencyAction::Flush => {
                    assert!(*buffered > 1_200);
                    speed = 1.0;
                    ctl.reset();
                }
                LatencyAction::Hold => {}
            }
        }
    }

    #[test]
    fn test_beyond_cap_flushes() {
        let mut ctl = LatencyController::new(LatencyConfig::default());
        assert_eq!(ctl.evaluate(&sample(1_300, 1.0, 0)), LatencyAction::Flush);
        assert_eq!(ctl.evaluate(&sample(1_200, 1.0, 0)), LatencyAction::SetSpeed(4.0));
    }

    #[test]
    fn test_speed_changes_rate_limited() {
        let mut ctl = LatencyController::new(LatencyConfig::default());
        assert_eq!(ctl.evaluate(&sample(400, 1.0, 0)), LatencyAction::SetSpeed(1.4));
        assert_eq!(ctl.evaluate(&sample(700, 1.4, 500)), LatencyAction::Hold);
        assert_eq!(ctl.evaluate(&sample(700, 1.4, 1_000)), LatencyAction::SetSpeed(2.4));
        // Returning to normal speed is rate-limited too
        assert_eq!(ctl.evaluate(&sample(80, 2.4, 1_500)), LatencyAction::Hold);
        assert_eq!(ctl.evaluate(&sample(80, 2.4, 2_000)), LatencyAction::SetSpeed(1.0));
    }

    #[test]
    fn test_holds_inside_window() {
        let mut ctl = LatencyController::new(LatencyConfig::default());
        assert_eq!(ctl.evaluate(&sample(200, 1.0, 0)), LatencyAction::Hold);
        assert_eq!(ctl.evaluate(&sample(200, 1.3, 0)), LatencyAction::Hold);
    }

    #[test]
    fn test_frame_limit_flushes() {
        let config = LatencyConfig {
            max_video_frames: 10,
            ..LatencyConfig::default()
        };
        let mut ctl = LatencyController::new(config);
        let mut s = sample(150, 1.0, 0);
        s.video_frames = 11;
        assert_eq!(ctl.evaluate(&s), LatencyAction::Flush);
    }
}
