//! Reverse playback.
//!
//! Mirrors the forward presenting loop with the timeline inverted:
//! `distance = (elapsed - pts) / speed`. Audio is disabled and sideband
//! streams are discarded while reversed. Entering or leaving reverse always
//! repositions the decoder at the current position and forces a resync.

use std::sync::Arc;

use crate::clock::Direction;
use crate::context::PlaybackContext;
use crate::error::PlaybackError;
use crate::frame_queue::{FrameQueue, StreamType};
use crate::sync::{classify, timeline_distance, FrameStep, SegmentTracker, SyncAction};

pub struct ReversePlaybackController {
    ctx: Arc<PlaybackContext>,
}

impl ReversePlaybackController {
    pub fn new(ctx: Arc<PlaybackContext>) -> Self {
        Self { ctx }
    }

    /// Switch the decoder to reverse demuxing at the current position.
    /// Returns the position landed on, in ms.
    pub fn enter(&self) -> Result<i64, PlaybackError> {
        if !self.ctx.decoder.supports_reverse() {
            return Err(PlaybackError::ReverseUnsupported);
        }
        self.switch(Direction::Reverse)
    }

    pub fn exit(&self) -> Result<i64, PlaybackError> {
        self.switch(Direction::Forward)
    }

    fn switch(&self, direction: Direction) -> Result<i64, PlaybackError> {
        let ctx = &self.ctx;
        let _exec = ctx.seeks.lock_exec();
        let reverse = direction.is_reverse();
        let position_ms = ctx.clock.elapsed_ms();
        let speed = ctx.clock.speed();

        ctx.decoder.pause();
        ctx.decoder.set_reverse(reverse)?;
        let landed_ms = match ctx.decoder.seek(position_ms, false, true) {
            Ok(ms) => ms,
            Err(e) => {
                // Leave the decoder in the direction the clock still runs in
                if let Err(revert) = ctx.decoder.set_reverse(!reverse) {
                    tracing::warn!("failed to restore decoder direction: {}", revert);
                }
                ctx.decoder.start();
                return Err(e.into());
            }
        };

        ctx.set_reverse_active(reverse);
        ctx.clear_queues(direction);
        ctx.clock
            .rebase_with_direction(position_ms * 1000, speed, direction);
        tracing::info!(
            "{} playback from {} ms (landed {} ms)",
            if reverse { "reverse" } else { "forward" },
            position_ms,
            landed_ms
        );
        Ok(landed_ms)
    }

    /// Present at most one video frame walking backwards.
    pub(crate) fn present_video(&self, video: &FrameQueue, tracker: &mut SegmentTracker) -> FrameStep {
        let ctx = &self.ctx;
        let policy = &ctx.config.policy;
        let speed = ctx.clock.speed();
        let elapsed = ctx.clock.elapsed_us();

        loop {
            let Some(head) = video.peek() else {
                return FrameStep::Empty;
            };
            if !tracker.accepts(StreamType::Video, head.pts_us, Direction::Reverse) {
                video.try_dequeue();
                ctx.stats.out_of_order();
                ctx.stats.dropped(StreamType::Video, 1);
                continue;
            }

            let distance = timeline_distance(head.pts_us, elapsed, speed, Direction::Reverse);
            match classify(distance, StreamType::Video, policy) {
                SyncAction::Present => {
                    let Some(frame) = video.try_dequeue() else {
                        return FrameStep::Empty;
                    };
                    ctx.renderer.render_play(&frame, false);
                    ctx.stats.presented(StreamType::Video);
                    tracker.record(&frame, Direction::Reverse);
                    return FrameStep::Presented;
                }
                SyncAction::Drop => {
                    if let Some(frame) = video.try_dequeue() {
                        ctx.stats.dropped(StreamType::Video, 1);
                        tracker.record(&frame, Direction::Reverse);
                    }
                }
                SyncAction::Rebuffer => return FrameStep::Rebuffer,
                SyncAction::Wait(us) => return FrameStep::Wait(us),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTimeSource;
    use crate::config::SyncConfig;
    use crate::render::RecordingRenderer;
    use crate::synthetic::{SyntheticDecoder, SyntheticSource};

    fn context(source: SyntheticSource) -> Arc<PlaybackContext> {
        let time = Arc::new(ManualTimeSource::new());
        Arc::new(PlaybackContext::new(
            SyncConfig::default(),
            time,
            Arc::new(SyntheticDecoder::new(source)),
            Arc::new(RecordingRenderer::new()),
            None,
        ))
    }

    #[test]
    fn enter_rebases_clock_backwards() {
        let ctx = context(SyntheticSource::default());
        ctx.clock.rebase(2_000_000, 1.0);
        let controller = ReversePlaybackController::new(ctx.clone());
        assert_eq!(controller.enter(), Ok(2_000));
        assert!(ctx.is_reverse_active());
        assert_eq!(ctx.clock.direction(), Direction::Reverse);
        assert_eq!(
            ctx.queue(StreamType::Video).unwrap().order(),
            Direction::Reverse
        );

        assert_eq!(controller.exit(), Ok(2_000));
        assert!(!ctx.is_reverse_active());
        assert_eq!(ctx.clock.direction(), Direction::Forward);
    }

    #[test]
    fn unsupported_decoder_is_rejected() {
        let ctx = context(SyntheticSource {
            supports_reverse: false,
            ..SyntheticSource::default()
        });
        let controller = ReversePlaybackController::new(ctx.clone());
        assert_eq!(controller.enter(), Err(PlaybackError::ReverseUnsupported));
        assert!(!ctx.is_reverse_active());
    }

    #[test]
    fn presents_descending_frames() {
        let ctx = context(SyntheticSource::default());
        ctx.clock.start(1_000_000);
        let controller = ReversePlaybackController::new(ctx.clone());
        controller.enter().expect("enter reverse");
        ctx.decoder.start();

        let video = ctx.queue(StreamType::Video).unwrap();
        let mut tracker = SegmentTracker::default();
        assert_eq!(controller.present_video(&video, &mut tracker), FrameStep::Presented);
        assert_eq!(controller.present_video(&video, &mut tracker), FrameStep::Wait(40_000));
        assert_eq!(tracker.boundary_us(), Some(960_000));
    }
}
