//! # Player
//!
//! Owns the pipeline threads:
//!
//! ```text
//!   control thread(s)          cadence-video             cadence-audio
//!   play/pause/seek/stop  -->  Synchronizer::run    AudioSynchronizer::run
//!          |                         |                        |
//!          +-------- PlaybackContext (clock, queues, events) -+
//!                               |
//!                          cadence-seek (paused seeks only)
//! ```
//!
//! Control calls never block on the pipeline; results arrive as
//! [`PlaybackEvent`]s.

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::audio::AudioSink;
use crate::audio_sync::AudioSynchronizer;
use crate::clock::{clamp_speed, TimeSource};
use crate::config::SyncConfig;
use crate::context::PlaybackContext;
use crate::decode::Decoder;
use crate::error::PlaybackError;
use crate::events::PlaybackEvent;
use crate::render::Renderer;
use crate::seek::{self, SeekRequest};
use crate::stats::PlaybackStats;
use crate::sync::{PlaybackState, Synchronizer};

pub struct Player {
    ctx: Arc<PlaybackContext>,
    video_thread: Option<JoinHandle<()>>,
    audio_thread: Option<JoinHandle<()>>,
    seek_threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Player {
    /// Validate the config, build the context and start playback threads.
    pub fn open(
        config: SyncConfig,
        time: Arc<dyn TimeSource>,
        decoder: Arc<dyn Decoder>,
        renderer: Arc<dyn Renderer>,
        audio_sink: Option<Arc<dyn AudioSink>>,
    ) -> Result<Self, PlaybackError> {
        config.validate()?;
        tracing::info!(
            "opening player on {} (auto_play={}, audio={})",
            decoder.name(),
            config.auto_play,
            audio_sink.is_some()
        );
        let ctx = Arc::new(PlaybackContext::new(
            config, time, decoder, renderer, audio_sink,
        ));

        let sync = Synchronizer::new(ctx.clone());
        let video_thread = thread::Builder::new()
            .name("cadence-video".into())
            .spawn(move || sync.run())
            .map_err(|e| PlaybackError::Spawn(format!("video: {}", e)))?;

        let mut player = Self {
            ctx: ctx.clone(),
            video_thread: Some(video_thread),
            audio_thread: None,
            seek_threads: Mutex::new(Vec::new()),
        };

        if ctx.audio_enabled() {
            let audio = AudioSynchronizer::new(ctx);
            let spawned = thread::Builder::new()
                .name("cadence-audio".into())
                .spawn(move || audio.run());
            match spawned {
                Ok(handle) => player.audio_thread = Some(handle),
                Err(e) => {
                    // Drop joins the video thread
                    return Err(PlaybackError::Spawn(format!("audio: {}", e)));
                }
            }
        }

        Ok(player)
    }

    pub fn context(&self) -> &Arc<PlaybackContext> {
        &self.ctx
    }

    pub fn subscribe(&self) -> Receiver<PlaybackEvent> {
        self.ctx.events.subscribe()
    }

    pub fn play(&self) {
        self.ctx.request_pause(false);
    }

    pub fn pause(&self) {
        self.ctx.request_pause(true);
    }

    pub fn is_paused(&self) -> bool {
        self.ctx.is_pause_requested()
    }

    /// Queue a seek and return its id. Never waits for the seek; completion
    /// arrives as `SeekCompleted`.
    pub fn seek(&self, request: SeekRequest) -> Result<u64, PlaybackError> {
        let id = self.ctx.seeks.push(request);
        self.ctx.wakeup.notify();
        // Before the first frame settles the scheduling thread takes the seek
        if self.ctx.is_pause_requested() && self.ctx.has_started() {
            if let Some(handle) = seek::spawn_paused_worker(self.ctx.clone())? {
                let mut threads = self.seek_threads.lock();
                threads.retain(|h| !h.is_finished());
                threads.push(handle);
            }
        }
        Ok(id)
    }

    pub fn seek_ms(&self, target_ms: i64) -> Result<u64, PlaybackError> {
        self.seek(SeekRequest::accurate(target_ms))
    }

    pub fn set_speed(&self, speed: f64) {
        self.ctx.request_speed(clamp_speed(speed));
    }

    pub fn set_reverse(&self, reverse: bool) -> Result<(), PlaybackError> {
        if reverse && !self.ctx.decoder.supports_reverse() {
            return Err(PlaybackError::ReverseUnsupported);
        }
        self.ctx.request_reverse(reverse);
        Ok(())
    }

    pub fn state(&self) -> PlaybackState {
        self.ctx.state()
    }

    pub fn position_ms(&self) -> i64 {
        self.ctx.position_ms()
    }

    pub fn speed(&self) -> f64 {
        self.ctx.clock.speed()
    }

    pub fn stats(&self) -> PlaybackStats {
        self.ctx.stats_snapshot()
    }

    /// Tear the pipeline down. Final: a stopped player cannot restart.
    pub fn stop(&mut self) {
        self.ctx.request_stop();
        for handle in [self.video_thread.take(), self.audio_thread.take()]
            .into_iter()
            .flatten()
        {
            if handle.join().is_err() {
                tracing::error!("playback thread panicked");
            }
        }
        for handle in self.seek_threads.lock().drain(..) {
            if handle.join().is_err() {
                tracing::error!("seek thread panicked");
            }
        }
        // The video thread normally reports the stop itself
        self.ctx.terminate(None);
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.stop();
    }
}
