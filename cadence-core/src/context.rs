//! Explicit playback context.
//!
//! Everything the scheduling thread, the audio thread and seek workers share
//! lives here and is handed to each of them at construction. There is no
//! global player or device registry.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::audio::AudioSink;
use crate::buffering::BufferingCounters;
use crate::clock::{Direction, PlaybackClock, TimeSource, Wakeup};
use crate::config::{LatencyMode, SyncConfig};
use crate::decode::Decoder;
use crate::error::PlaybackError;
use crate::events::{EventBus, PlaybackEvent};
use crate::frame_queue::{FrameQueue, StreamType};
use crate::render::Renderer;
use crate::seek::SeekCoordinator;
use crate::stats::{PlaybackStats, SyncStats};
use crate::sync::PlaybackState;

pub struct PlaybackContext {
    pub config: SyncConfig,
    pub time: Arc<dyn TimeSource>,
    pub clock: PlaybackClock,
    pub decoder: Arc<dyn Decoder>,
    pub renderer: Arc<dyn Renderer>,
    pub audio_sink: Option<Arc<dyn AudioSink>>,
    pub seeks: SeekCoordinator,
    pub buffering: BufferingCounters,
    pub events: EventBus,
    pub stats: SyncStats,
    pub wakeup: Wakeup,

    state: Mutex<PlaybackState>,
    stop_requested: AtomicBool,
    pause_requested: AtomicBool,
    reverse_requested: AtomicBool,
    reverse_active: AtomicBool,
    resync_requested: AtomicBool,
    speed_request: Mutex<Option<f64>>,
    terminated: AtomicBool,
    /// First buffering has settled
    started: AtomicBool,
}

impl PlaybackContext {
    pub fn new(
        config: SyncConfig,
        time: Arc<dyn TimeSource>,
        decoder: Arc<dyn Decoder>,
        renderer: Arc<dyn Renderer>,
        audio_sink: Option<Arc<dyn AudioSink>>,
    ) -> Self {
        let paused = !config.auto_play;
        Self {
            clock: PlaybackClock::new(time.clone()),
            config,
            time,
            decoder,
            renderer,
            audio_sink,
            seeks: SeekCoordinator::new(),
            buffering: BufferingCounters::new(),
            events: EventBus::new(),
            stats: SyncStats::new(),
            wakeup: Wakeup::new(),
            state: Mutex::new(PlaybackState::Buffering),
            stop_requested: AtomicBool::new(false),
            pause_requested: AtomicBool::new(paused),
            reverse_requested: AtomicBool::new(false),
            reverse_active: AtomicBool::new(false),
            resync_requested: AtomicBool::new(false),
            speed_request: Mutex::new(None),
            terminated: AtomicBool::new(false),
            started: AtomicBool::new(false),
        }
    }

    // ========================================================================
    // State
    // ========================================================================

    pub fn state(&self) -> PlaybackState {
        *self.state.lock()
    }

    pub fn set_state(&self, to: PlaybackState) {
        let from = {
            let mut state = self.state.lock();
            if *state == to || *state == PlaybackState::Stopped {
                return;
            }
            std::mem::replace(&mut *state, to)
        };
        tracing::debug!("state {:?} -> {:?}", from, to);
        self.events.emit(PlaybackEvent::StateChanged { from, to });
    }

    /// Final transition. `PlaybackStopped` fires exactly once.
    pub fn terminate(&self, error: Option<PlaybackError>) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.wakeup.notify();
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        match &error {
            Some(err) => tracing::error!("playback stopped: {}", err),
            None => tracing::info!("playback stopped"),
        }
        self.set_state(PlaybackState::Stopped);
        self.events.emit(PlaybackEvent::PlaybackStopped { error });
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Requests from control threads
    // ========================================================================

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.wakeup.notify();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn request_pause(&self, paused: bool) {
        self.pause_requested.store(paused, Ordering::SeqCst);
        self.wakeup.notify();
    }

    pub fn is_pause_requested(&self) -> bool {
        self.pause_requested.load(Ordering::SeqCst)
    }

    pub fn request_reverse(&self, reverse: bool) {
        self.reverse_requested.store(reverse, Ordering::SeqCst);
        self.wakeup.notify();
    }

    pub fn is_reverse_requested(&self) -> bool {
        self.reverse_requested.load(Ordering::SeqCst)
    }

    pub fn set_reverse_active(&self, active: bool) {
        self.reverse_active.store(active, Ordering::SeqCst);
    }

    pub fn is_reverse_active(&self) -> bool {
        self.reverse_active.load(Ordering::SeqCst)
    }

    /// Ask the scheduling thread to rebuffer before presenting again
    pub fn request_resync(&self) {
        self.resync_requested.store(true, Ordering::SeqCst);
        self.wakeup.notify();
    }

    pub fn take_resync_request(&self) -> bool {
        self.resync_requested.swap(false, Ordering::SeqCst)
    }

    pub fn request_speed(&self, speed: f64) {
        *self.speed_request.lock() = Some(speed);
        self.wakeup.notify();
    }

    pub fn take_speed_request(&self) -> Option<f64> {
        self.speed_request.lock().take()
    }

    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    /// Until this is true the scheduling thread owns every pending seek
    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// A blocking wait should give up: stop or a newer seek is pending
    pub fn should_interrupt(&self) -> bool {
        self.is_stop_requested() || self.seeks.has_pending()
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    pub fn sleep(&self, duration: Duration) {
        self.time.sleep(duration, &self.wakeup);
    }

    pub fn sleep_us(&self, us: i64) {
        if us > 0 {
            self.sleep(Duration::from_micros(us as u64));
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.buffering.poll_interval_ms)
    }

    pub fn queue(&self, stream: StreamType) -> Option<Arc<FrameQueue>> {
        self.decoder.queue(stream)
    }

    /// Video when present, otherwise audio
    pub fn primary_stream(&self) -> StreamType {
        if self.decoder.queue(StreamType::Video).is_some() {
            StreamType::Video
        } else {
            StreamType::Audio
        }
    }

    /// Audio is fed by the audio thread
    pub fn audio_enabled(&self) -> bool {
        self.config.audio.enabled
            && self.audio_sink.is_some()
            && self.decoder.queue(StreamType::Audio).is_some()
    }

    pub fn latency_enabled(&self) -> bool {
        match self.config.latency.mode {
            LatencyMode::Off => false,
            LatencyMode::Auto => self.decoder.is_live(),
            LatencyMode::Always => true,
        }
    }

    /// Dispose every queued frame and open a resync boundary.
    pub fn clear_queues(&self, order: Direction) {
        for stream in StreamType::ALL {
            if let Some(queue) = self.decoder.queue(stream) {
                queue.clear();
                queue.mark_resync(order);
            }
        }
        if let Some(sink) = &self.audio_sink {
            sink.clear_buffer();
        }
    }

    pub fn position_ms(&self) -> i64 {
        self.clock.elapsed_ms()
    }

    pub fn stats_snapshot(&self) -> PlaybackStats {
        self.stats
            .snapshot(self.seeks.discarded(), self.clock.speed())
    }
}
