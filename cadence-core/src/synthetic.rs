//! # Synthetic Decoder
//!
//! Deterministic frame source implementing [`Decoder`]. Generates evenly
//! spaced video/audio/subtitle/data frames for a fixed duration, with
//! optional interlacing, live pacing, injected audio gaps, stalled streams
//! and reverse demuxing.
//!
//! Production is either inline (queues are topped up on `start()`) or
//! threaded (a worker keeps them topped up).

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crate::clock::{Direction, TimeSource};
use crate::decode::{DecodeError, Decoder, DecoderStatus};
use crate::frame_queue::{Frame, FrameQueue, PushOutcome, StreamType};

/// Shape of the generated source
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    /// 0 disables video
    pub video_fps: f64,
    /// Audio frame length; 0 disables audio
    pub audio_frame_us: i64,
    /// Subtitle cadence; 0 disables subtitles
    pub subtitle_interval_us: i64,
    pub subtitle_duration_us: i64,
    /// Data (metadata/timed text) cadence; 0 disables data
    pub data_interval_us: i64,
    pub duration_us: i64,
    /// Keyframe spacing in video frames
    pub gop_frames: u32,
    pub interlaced: bool,
    /// Paced against the time source instead of decoding ahead freely
    pub live: bool,
    /// How far past the live edge a live source has already buffered
    pub live_burst_us: i64,
    pub supports_reverse: bool,
    pub queue_capacity: usize,
    /// `(at_us, gap_us)`: audio timestamps jump by `gap_us` from `at_us` on
    pub audio_gaps: Vec<(i64, i64)>,
    pub video_stalled: bool,
    pub audio_stalled: bool,
    pub seek_error: Option<DecodeError>,
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self {
            video_fps: 25.0,
            audio_frame_us: 20_000,
            subtitle_interval_us: 0,
            subtitle_duration_us: 0,
            data_interval_us: 0,
            duration_us: 10_000_000,
            gop_frames: 1,
            interlaced: false,
            live: false,
            live_burst_us: 0,
            supports_reverse: true,
            queue_capacity: 64,
            audio_gaps: Vec::new(),
            video_stalled: false,
            audio_stalled: false,
            seek_error: None,
        }
    }
}

impl SyntheticSource {
    pub fn video_interval_us(&self) -> i64 {
        if self.video_fps > 0.0 {
            (1_000_000.0 / self.video_fps).round() as i64
        } else {
            0
        }
    }

    fn interval(&self, stream: StreamType) -> i64 {
        match stream {
            StreamType::Video => self.video_interval_us(),
            StreamType::Audio => self.audio_frame_us,
            StreamType::Subtitle => self.subtitle_interval_us,
            StreamType::Data => self.data_interval_us,
        }
    }

    fn frame_duration(&self, stream: StreamType) -> i64 {
        match stream {
            StreamType::Subtitle if self.subtitle_duration_us > 0 => self.subtitle_duration_us,
            _ => self.interval(stream),
        }
    }

    fn stalled(&self, stream: StreamType) -> bool {
        match stream {
            StreamType::Video => self.video_stalled,
            StreamType::Audio => self.audio_stalled,
            _ => false,
        }
    }

    /// Accumulated audio gap at nominal position `nominal_us`
    fn audio_shift(&self, nominal_us: i64) -> i64 {
        self.audio_gaps
            .iter()
            .filter(|(at, _)| *at <= nominal_us)
            .map(|(_, gap)| *gap)
            .sum()
    }
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
    /// Nominal timeline position of the next frame
    next_us: i64,
    done: bool,
}

struct DecoderState {
    cursors: [Option<Cursor>; 4],
    running: bool,
    reverse: bool,
    /// Live edge origin: (wall time, timeline position)
    live_origin: Option<(i64, i64)>,
    seeks: Vec<(i64, bool, bool)>,
}

pub struct SyntheticDecoder {
    source: SyntheticSource,
    queues: [Option<Arc<FrameQueue>>; 4],
    state: Mutex<DecoderState>,
    time: Option<Arc<dyn TimeSource>>,
    threaded: bool,
    stopped: AtomicBool,
    resync_required: AtomicBool,
}

impl SyntheticDecoder {
    /// Inline production without live pacing
    pub fn new(source: SyntheticSource) -> Self {
        Self::build(source, None, false)
    }

    /// Inline production; live sources are paced against `time`
    pub fn with_time(source: SyntheticSource, time: Arc<dyn TimeSource>) -> Self {
        Self::build(source, Some(time), false)
    }

    /// Threaded production with a background worker
    pub fn spawn(source: SyntheticSource, time: Arc<dyn TimeSource>) -> Arc<Self> {
        let decoder = Arc::new(Self::build(source, Some(time), true));
        let weak: Weak<Self> = Arc::downgrade(&decoder);
        let spawned = thread::Builder::new()
            .name("synthetic-decode".into())
            .spawn(move || loop {
                let Some(this) = weak.upgrade() else {
                    break;
                };
                if this.stopped.load(Ordering::SeqCst) {
                    break;
                }
                this.pump();
                drop(this);
                thread::sleep(Duration::from_millis(2));
            });
        if let Err(e) = spawned {
            tracing::error!("failed to spawn synthetic decode thread: {}", e);
        }
        decoder
    }

    fn build(source: SyntheticSource, time: Option<Arc<dyn TimeSource>>, threaded: bool) -> Self {
        let mut queues: [Option<Arc<FrameQueue>>; 4] = Default::default();
        let mut cursors: [Option<Cursor>; 4] = [None; 4];
        for stream in StreamType::ALL {
            if source.interval(stream) > 0 {
                queues[stream.index()] = Some(Arc::new(FrameQueue::with_capacity(
                    stream,
                    source.queue_capacity,
                )));
                cursors[stream.index()] = Some(Cursor {
                    next_us: 0,
                    done: false,
                });
            }
        }
        Self {
            source,
            queues,
            state: Mutex::new(DecoderState {
                cursors,
                running: false,
                reverse: false,
                live_origin: None,
                seeks: Vec::new(),
            }),
            time,
            threaded,
            stopped: AtomicBool::new(false),
            resync_required: AtomicBool::new(false),
        }
    }

    pub fn source(&self) -> &SyntheticSource {
        &self.source
    }

    /// Every seek call received: (target_ms, forward, accurate)
    pub fn seek_log(&self) -> Vec<(i64, bool, bool)> {
        self.state.lock().seeks.clone()
    }

    /// Simulate a stream switch that requires a clock resync
    pub fn switch_stream(&self) {
        self.resync_required.store(true, Ordering::SeqCst);
    }

    /// Stop the worker thread (threaded mode)
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.state.lock().running = false;
    }

    fn live_edge(&self, state: &DecoderState) -> Option<i64> {
        if !self.source.live {
            return None;
        }
        let time = self.time.as_ref()?;
        let (wall0, pos0) = state.live_origin?;
        Some(pos0 + (time.now_us() - wall0) + self.source.live_burst_us)
    }

    /// Top up every queue as far as capacity, input and live edge allow.
    pub fn pump(&self) {
        let mut state = self.state.lock();
        if !state.running || self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let edge = self.live_edge(&state);
        let reverse = state.reverse;

        for stream in StreamType::ALL {
            let Some(queue) = &self.queues[stream.index()] else {
                continue;
            };
            if self.source.stalled(stream) {
                continue;
            }
            let Some(cursor) = state.cursors[stream.index()].as_mut() else {
                continue;
            };
            // Reverse demuxing only covers video
            if reverse && stream != StreamType::Video {
                continue;
            }
            self.produce(stream, queue, cursor, reverse, edge);
        }

        let all_done = state
            .cursors
            .iter()
            .enumerate()
            .filter(|(i, _)| !(reverse && *i != StreamType::Video.index()))
            .all(|(i, c)| match c {
                Some(c) => c.done && !self.source.stalled(StreamType::ALL[i]),
                None => true,
            });
        if all_done {
            for queue in self.queues.iter().flatten() {
                queue.signal_eos();
            }
        }
    }

    fn produce(
        &self,
        stream: StreamType,
        queue: &FrameQueue,
        cursor: &mut Cursor,
        reverse: bool,
        edge: Option<i64>,
    ) {
        let interval = self.source.interval(stream);
        let duration = self.source.frame_duration(stream);
        let gop = self.source.gop_frames.max(1) as i64;

        while !cursor.done && !queue.is_full() {
            let nominal = cursor.next_us;
            if nominal < 0 || nominal >= self.source.duration_us {
                cursor.done = true;
                break;
            }
            if let Some(edge) = edge {
                if nominal > edge {
                    break;
                }
            }

            let pts = if stream == StreamType::Audio {
                nominal + self.source.audio_shift(nominal)
            } else {
                nominal
            };
            let index = nominal / interval;
            let frame = Frame::new(stream, pts, duration, Bytes::from(pts.to_le_bytes().to_vec()))
                .with_keyframe(stream != StreamType::Video || index % gop == 0)
                .with_interlaced(stream == StreamType::Video && self.source.interlaced);

            match queue.enqueue(frame) {
                PushOutcome::Full => break,
                PushOutcome::Queued | PushOutcome::OutOfOrder => {
                    cursor.next_us = if reverse {
                        nominal - interval
                    } else {
                        nominal + interval
                    };
                }
            }
        }
    }

    fn direction(reverse: bool) -> Direction {
        if reverse {
            Direction::Reverse
        } else {
            Direction::Forward
        }
    }
}

impl Decoder for SyntheticDecoder {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn start(&self) {
        {
            let mut state = self.state.lock();
            state.running = true;
            if self.source.live && state.live_origin.is_none() {
                if let Some(time) = &self.time {
                    let pos = state.cursors[StreamType::Video.index()]
                        .map(|c| c.next_us)
                        .unwrap_or(0);
                    state.live_origin = Some((time.now_us(), pos));
                }
            }
        }
        if !self.threaded {
            self.pump();
        }
    }

    fn pause(&self) {
        self.state.lock().running = false;
    }

    fn flush(&self) {
        let mut state = self.state.lock();
        let order = Self::direction(state.reverse);
        for queue in self.queues.iter().flatten() {
            queue.clear();
            queue.mark_resync(order);
        }
        // A flushed live source resumes at the live edge
        if let Some(edge) = self.live_edge(&state) {
            let edge = edge - self.source.live_burst_us;
            for stream in StreamType::ALL {
                let interval = self.source.interval(stream);
                if let Some(cursor) = state.cursors[stream.index()].as_mut() {
                    cursor.next_us = (edge / interval) * interval;
                    cursor.done = false;
                }
            }
        }
    }

    fn seek(&self, target_ms: i64, forward: bool, accurate: bool) -> Result<i64, DecodeError> {
        let mut state = self.state.lock();
        state.seeks.push((target_ms, forward, accurate));
        if let Some(err) = &self.source.seek_error {
            return Err(err.clone());
        }

        let target_us = (target_ms * 1000).clamp(0, self.source.duration_us);
        let reverse = state.reverse;
        let gop = self.source.gop_frames.max(1) as i64;
        let mut landed_us = target_us;

        for stream in StreamType::ALL {
            let interval = self.source.interval(stream);
            let Some(cursor) = state.cursors[stream.index()].as_mut() else {
                continue;
            };
            let mut index = target_us / interval;
            if stream == StreamType::Video {
                if !accurate && !reverse {
                    index = if forward {
                        ((index + gop - 1) / gop) * gop
                    } else {
                        (index / gop) * gop
                    };
                }
                landed_us = index * interval;
            }
            cursor.next_us = index * interval;
            cursor.done = false;
        }

        if state.live_origin.is_some() {
            if let Some(time) = &self.time {
                state.live_origin = Some((time.now_us(), landed_us));
            }
        }
        for queue in self.queues.iter().flatten() {
            queue.clear_eos();
        }
        Ok(landed_us / 1000)
    }

    fn queue(&self, stream: StreamType) -> Option<Arc<FrameQueue>> {
        self.queues[stream.index()].clone()
    }

    fn status(&self) -> DecoderStatus {
        if self.stopped.load(Ordering::SeqCst) {
            return DecoderStatus::Stopped;
        }
        let state = self.state.lock();
        let relevant = |i: usize| !(state.reverse && i != StreamType::Video.index());
        let ended = state.cursors.iter().enumerate().all(|(i, c)| match c {
            Some(c) if relevant(i) => c.done && !self.source.stalled(StreamType::ALL[i]),
            _ => true,
        });
        if ended {
            return DecoderStatus::Ended;
        }
        if !state.running {
            return DecoderStatus::Paused;
        }
        let full = self
            .queues
            .iter()
            .flatten()
            .all(|q| q.is_full());
        if full {
            DecoderStatus::QueueFull
        } else {
            DecoderStatus::Running
        }
    }

    fn requires_resync(&self) -> bool {
        self.resync_required.load(Ordering::SeqCst)
    }

    fn resync(&self, pts_us: i64) {
        tracing::debug!("synthetic decoder resynced at {} us", pts_us);
        self.resync_required.store(false, Ordering::SeqCst);
    }

    fn supports_reverse(&self) -> bool {
        self.source.supports_reverse
    }

    fn set_reverse(&self, reverse: bool) -> Result<(), DecodeError> {
        if reverse && !self.source.supports_reverse {
            return Err(DecodeError::ReverseUnsupported);
        }
        let mut state = self.state.lock();
        state.reverse = reverse;
        for queue in self.queues.iter().flatten() {
            queue.mark_resync(Self::direction(reverse));
        }
        Ok(())
    }

    fn is_live(&self) -> bool {
        self.source.live
    }
}

impl Drop for SyntheticDecoder {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTimeSource;

    #[test]
    fn test_inline_fills_queues() {
        let decoder = SyntheticDecoder::new(SyntheticSource::default());
        decoder.start();
        let video = decoder.queue(StreamType::Video).unwrap();
        let audio = decoder.queue(StreamType::Audio).unwrap();
        assert!(video.is_full());
        assert!(audio.is_full());
        assert_eq!(video.peek().unwrap().pts_us, 0);
        assert!(decoder.queue(StreamType::Subtitle).is_none());
    }

    #[test]
    fn test_ends_after_duration() {
        let source = SyntheticSource {
            duration_us: 200_000,
            ..SyntheticSource::default()
        };
        let decoder = SyntheticDecoder::new(source);
        decoder.start();
        assert_eq!(decoder.status(), DecoderStatus::Ended);
        let video = decoder.queue(StreamType::Video).unwrap();
        assert_eq!(video.len(), 5);
        assert!(video.is_eos());
    }

    #[test]
    fn test_keyframe_aligned_seek() {
        let source = SyntheticSource {
            gop_frames: 10,
            ..SyntheticSource::default()
        };
        let decoder = SyntheticDecoder::new(source);
        // 40ms frames, keyframe every 400ms
        assert_eq!(decoder.seek(1_000, false, false), Ok(800));
        assert_eq!(decoder.seek(1_000, true, false), Ok(1_200));
        assert_eq!(decoder.seek(1_000, false, true), Ok(1_000));
        assert_eq!(decoder.seek_log().len(), 3);
    }

    #[test]
    fn test_audio_gap_shifts_timestamps() {
        let source = SyntheticSource {
            video_fps: 0.0,
            audio_gaps: vec![(100_000, 60_000)],
            ..SyntheticSource::default()
        };
        let decoder = SyntheticDecoder::new(source);
        decoder.start();
        let audio = decoder.queue(StreamType::Audio).unwrap();
        let pts: Vec<i64> = (0..7).map(|_| audio.try_dequeue().unwrap().pts_us).collect();
        assert_eq!(pts, vec![0, 20_000, 40_000, 60_000, 80_000, 160_000, 180_000]);
    }

    #[test]
    fn test_reverse_produces_descending_video() {
        let decoder = SyntheticDecoder::new(SyntheticSource::default());
        decoder.set_reverse(true).unwrap();
        decoder.seek(1_000, false, true).unwrap();
        decoder.start();
        let video = decoder.queue(StreamType::Video).unwrap();
        let a = video.try_dequeue().unwrap().pts_us;
        let b = video.try_dequeue().unwrap().pts_us;
        assert_eq!((a, b), (1_000_000, 960_000));
        assert!(decoder.queue(StreamType::Audio).unwrap().is_empty());
    }

    #[test]
    fn test_reverse_unsupported() {
        let source = SyntheticSource {
            supports_reverse: false,
            ..SyntheticSource::default()
        };
        let decoder = SyntheticDecoder::new(source);
        assert_eq!(decoder.set_reverse(true), Err(DecodeError::ReverseUnsupported));
    }

    #[test]
    fn test_live_pacing() {
        let time = Arc::new(ManualTimeSource::new());
        let source = SyntheticSource {
            live: true,
            audio_frame_us: 0,
            ..SyntheticSource::default()
        };
        let decoder = SyntheticDecoder::with_time(source, time.clone());
        decoder.start();
        let video = decoder.queue(StreamType::Video).unwrap();
        assert_eq!(video.len(), 1);
        time.advance(200_000);
        decoder.pump();
        assert_eq!(video.len(), 6);
    }

    #[test]
    fn test_threaded_worker_fills() {
        let time: Arc<dyn TimeSource> = Arc::new(crate::clock::SystemTimeSource::new());
        let decoder = SyntheticDecoder::spawn(SyntheticSource::default(), time);
        decoder.start();
        let video = decoder.queue(StreamType::Video).unwrap();
        for _ in 0..200 {
            if video.is_full() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(video.is_full());
        decoder.shutdown();
    }
}
