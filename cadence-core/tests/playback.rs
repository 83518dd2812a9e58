//! End-to-end playback scenarios.
//!
//! Threaded tests drive a real [`Player`] against wall-clock time with
//! generous timeouts. Timing-sensitive scenarios step a [`Synchronizer`]
//! directly on virtual time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cadence_core::config::LatencyMode;
use cadence_core::render::RecordingRenderer;
use cadence_core::sync::Synchronizer;
use cadence_core::synthetic::{SyntheticDecoder, SyntheticSource};
use cadence_core::{
    ManualTimeSource, PlaybackEvent, PlaybackState, Player, SeekRequest, SyncConfig,
    SystemTimeSource,
};
use crossbeam_channel::Receiver;

const TIMEOUT: Duration = Duration::from_secs(5);

fn video_only(duration_us: i64) -> SyntheticSource {
    SyntheticSource {
        audio_frame_us: 0,
        duration_us,
        ..SyntheticSource::default()
    }
}

fn open(source: SyntheticSource, config: SyncConfig) -> (Player, Arc<SyntheticDecoder>, Arc<RecordingRenderer>) {
    let time = Arc::new(SystemTimeSource::new());
    let decoder = SyntheticDecoder::spawn(source, time.clone());
    let renderer = Arc::new(RecordingRenderer::new());
    let player = Player::open(config, time, decoder.clone(), renderer.clone(), None)
        .expect("player opens");
    (player, decoder, renderer)
}

fn wait_event(events: &Receiver<PlaybackEvent>, matches: impl Fn(&PlaybackEvent) -> bool) -> PlaybackEvent {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining) {
            Ok(event) if matches(&event) => return event,
            Ok(_) => {}
            Err(_) => panic!("event not received within {:?}", TIMEOUT),
        }
    }
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(5));
    }
}

// ============================================================================
// Threaded player
// ============================================================================

#[test]
fn plays_to_end_then_stops_once() {
    let (mut player, decoder, renderer) = open(video_only(400_000), SyncConfig::default());
    let events = player.subscribe();

    wait_event(&events, |e| *e == PlaybackEvent::Ended);
    assert_eq!(player.state(), PlaybackState::Ended);
    let played = renderer.played_video();
    assert!(!played.is_empty());
    assert!(played.windows(2).all(|w| w[0] <= w[1]));

    player.stop();
    decoder.shutdown();
    assert_eq!(player.state(), PlaybackState::Stopped);

    let stopped: Vec<_> = events
        .try_iter()
        .filter(|e| matches!(e, PlaybackEvent::PlaybackStopped { .. }))
        .collect();
    assert_eq!(stopped, vec![PlaybackEvent::PlaybackStopped { error: None }]);
}

#[test]
fn paused_seek_shows_target_frame() {
    let config = SyncConfig {
        auto_play: false,
        ..SyncConfig::default()
    };
    let (mut player, decoder, renderer) = open(video_only(5_000_000), config);
    let events = player.subscribe();
    assert!(player.is_paused());
    wait_until("initial buffering", || player.state() == PlaybackState::Paused);

    let id = player.seek_ms(2_000).expect("seek queued");
    let completed = wait_event(&events, |e| matches!(e, PlaybackEvent::SeekCompleted { .. }));
    assert_eq!(
        completed,
        PlaybackEvent::SeekCompleted {
            id,
            result_ms: 2_000,
            error: None
        }
    );
    assert!(renderer.log().iter().any(|f| f.pts_us == 2_000_000));
    assert_eq!(player.position_ms(), 2_000);
    // still paused: nothing was played
    assert!(renderer.played_video().is_empty());

    player.play();
    wait_until("playback past the seek target", || player.position_ms() >= 2_100);
    assert!(renderer.played_video().iter().all(|&pts| pts >= 2_000_000));

    player.stop();
    decoder.shutdown();
}

#[test]
fn seek_right_after_open_lands_while_paused() {
    let config = SyncConfig {
        auto_play: false,
        ..SyncConfig::default()
    };
    let (mut player, decoder, renderer) = open(video_only(5_000_000), config);
    let events = player.subscribe();

    // no wait: the seek races the initial buffering
    let id = player.seek_ms(2_000).expect("seek queued");
    let completed = wait_event(&events, |e| matches!(e, PlaybackEvent::SeekCompleted { .. }));
    assert_eq!(
        completed,
        PlaybackEvent::SeekCompleted {
            id,
            result_ms: 2_000,
            error: None
        }
    );
    wait_until("paused after seek", || player.state() == PlaybackState::Paused);
    assert_eq!(player.position_ms(), 2_000);
    assert!(renderer.played_video().is_empty());

    player.play();
    wait_until("playback past the seek target", || player.position_ms() >= 2_100);
    assert!(renderer.played_video().iter().all(|&pts| pts >= 2_000_000));

    player.stop();
    decoder.shutdown();
}

#[test]
fn stopped_player_ignores_controls() {
    let (mut player, decoder, _renderer) = open(video_only(5_000_000), SyncConfig::default());
    let events = player.subscribe();
    wait_until("presenting", || player.state() == PlaybackState::Presenting);

    player.stop();
    player.play();
    player.set_speed(2.0);
    player.seek(SeekRequest::new(1_000)).expect("seek queued");
    decoder.shutdown();

    assert_eq!(player.state(), PlaybackState::Stopped);
    let stops = events
        .try_iter()
        .filter(|e| matches!(e, PlaybackEvent::PlaybackStopped { .. }))
        .count();
    assert_eq!(stops, 1);
}

// ============================================================================
// Virtual time
// ============================================================================

fn stepped(source: SyntheticSource, config: SyncConfig) -> (Synchronizer, Arc<RecordingRenderer>) {
    let time = Arc::new(ManualTimeSource::new());
    let decoder = Arc::new(SyntheticDecoder::with_time(source, time.clone()));
    let renderer = Arc::new(RecordingRenderer::new());
    let ctx = Arc::new(cadence_core::context::PlaybackContext::new(
        config,
        time,
        decoder,
        renderer.clone(),
        None,
    ));
    (Synchronizer::new(ctx), renderer)
}

#[test]
fn reverse_retraces_forward_frames() {
    let (mut sync, renderer) = stepped(video_only(10_000_000), SyncConfig::default());
    let ctx = sync.context().clone();
    let interval = 40_000;
    let n = 10;

    ctx.seeks.push(SeekRequest::accurate(2_000));
    let mut steps = 0;
    while renderer.played_video().len() < n {
        sync.step();
        steps += 1;
        assert!(steps < 10_000, "forward playback stalled");
    }
    let forward = renderer.played_video();
    assert_eq!(forward[0], 2_000_000);

    ctx.request_reverse(true);
    while renderer.played_video().len() < 2 * n {
        sync.step();
        steps += 1;
        assert!(steps < 20_000, "reverse playback stalled");
    }
    assert!(ctx.is_reverse_active());

    let backward = renderer.played_video()[n..2 * n].to_vec();
    assert!(backward.windows(2).all(|w| w[0] > w[1]), "{:?}", backward);

    let mut fwd = forward.clone();
    let mut bwd = backward.clone();
    fwd.sort_unstable();
    bwd.sort_unstable();
    for (f, b) in fwd.iter().zip(&bwd) {
        assert!((f - b).abs() <= interval, "forward {:?} backward {:?}", fwd, bwd);
    }
}

#[test]
fn moderate_live_latency_speeds_up() {
    let mut config = SyncConfig::default();
    config.latency.mode = LatencyMode::Always;
    let source = SyntheticSource {
        live: true,
        live_burst_us: 600_000,
        queue_capacity: 256,
        ..video_only(60_000_000)
    };
    let (mut sync, _renderer) = stepped(source, config);
    let ctx = sync.context().clone();
    let events = ctx.events.subscribe();

    for _ in 0..50 {
        sync.step();
    }

    let speeds: Vec<f64> = events
        .try_iter()
        .filter_map(|e| match e {
            PlaybackEvent::SpeedChanged { speed } => Some(speed),
            _ => None,
        })
        .collect();
    assert!(!speeds.is_empty(), "no speed change");
    assert!(speeds[0] > 1.0);
    assert!(speeds.iter().all(|&s| s <= ctx.config.latency.max_speed));
    assert_eq!(ctx.stats_snapshot().latency_flushes, 0);
}

#[test]
fn runaway_live_latency_flushes() {
    let mut config = SyncConfig::default();
    config.latency.mode = LatencyMode::Always;
    let source = SyntheticSource {
        live: true,
        live_burst_us: 2_000_000,
        queue_capacity: 256,
        ..video_only(60_000_000)
    };
    let (mut sync, _renderer) = stepped(source, config);
    let ctx = sync.context().clone();

    for _ in 0..20 {
        sync.step();
    }

    let stats = ctx.stats_snapshot();
    assert!(stats.latency_flushes >= 1);
    assert!(ctx.clock.speed() <= ctx.config.latency.max_speed);
    assert_eq!(stats.speed_changes, 0, "flush never raises speed");
}
