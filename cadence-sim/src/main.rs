//! # Cadence Simulator
//!
//! Plays a synthetic source through the synchronizer in real time and prints
//! the resulting statistics as JSON.
//!
//! ```text
//! cadence-sim --run-ms 3000 --fps 30 --seek 5000@1000 --reverse-at 2000
//! ```

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cadence_core::audio::{AudioSink, SimulatedAudioSink};
use cadence_core::clock::{SystemTimeSource, TimeSource};
use cadence_core::config::{LatencyMode, SyncConfig};
use cadence_core::render::RecordingRenderer;
use cadence_core::stats::PlaybackStats;
use cadence_core::synthetic::{SyntheticDecoder, SyntheticSource};
use cadence_core::{PlaybackEvent, PlaybackState, Player, SeekRequest};

// ============================================================================
// Options
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Action {
    Seek(i64),
    Reverse(bool),
    Pause(bool),
    Speed(f64),
}

#[derive(Debug)]
struct SimOptions {
    config: Option<PathBuf>,
    run_ms: u64,
    source: SyntheticSource,
    device_delay_us: i64,
    audio: bool,
    double_rate: bool,
    latency: Option<LatencyMode>,
    /// (at_ms, action), sorted by time
    schedule: Vec<(u64, Action)>,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            config: None,
            run_ms: 2_000,
            source: SyntheticSource::default(),
            device_delay_us: 20_000,
            audio: true,
            double_rate: false,
            latency: None,
            schedule: Vec::new(),
        }
    }
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("Missing value for {}", flag))
}

/// `VALUE@AT_MS`
fn timed<T: std::str::FromStr>(raw: &str, flag: &str) -> Result<(T, u64)> {
    let (v, at) = raw
        .split_once('@')
        .ok_or_else(|| anyhow!("{} expects VALUE@MS, got {:?}", flag, raw))?;
    let v = v
        .parse()
        .map_err(|_| anyhow!("Invalid value for {}: {:?}", flag, v))?;
    let at = at
        .parse()
        .with_context(|| format!("Invalid time for {}: {:?}", flag, at))?;
    Ok((v, at))
}

fn parse_args(args: &[String]) -> Result<SimOptions> {
    let mut options = SimOptions::default();
    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--config" | "-c" => {
                options.config = Some(PathBuf::from(value(args, i, flag)?));
                i += 2;
            }
            "--run-ms" => {
                options.run_ms = value(args, i, flag)?.parse()?;
                i += 2;
            }
            "--source-ms" => {
                let ms: i64 = value(args, i, flag)?.parse()?;
                options.source.duration_us = ms * 1000;
                i += 2;
            }
            "--fps" => {
                options.source.video_fps = value(args, i, flag)?.parse()?;
                i += 2;
            }
            "--gop" => {
                options.source.gop_frames = value(args, i, flag)?.parse()?;
                i += 2;
            }
            "--subtitles-ms" => {
                let ms: i64 = value(args, i, flag)?.parse()?;
                options.source.subtitle_interval_us = ms * 1000;
                options.source.subtitle_duration_us = ms * 500;
                i += 2;
            }
            "--audio-gap" => {
                let (gap_ms, at_ms): (i64, u64) = timed(value(args, i, flag)?, flag)?;
                options
                    .source
                    .audio_gaps
                    .push((at_ms as i64 * 1000, gap_ms * 1000));
                i += 2;
            }
            "--device-delay-ms" => {
                let ms: i64 = value(args, i, flag)?.parse()?;
                options.device_delay_us = ms * 1000;
                i += 2;
            }
            "--live" => {
                options.source.live = true;
                i += 1;
            }
            "--burst-ms" => {
                let ms: i64 = value(args, i, flag)?.parse()?;
                options.source.live_burst_us = ms * 1000;
                i += 2;
            }
            "--latency" => {
                options.latency = Some(match value(args, i, flag)? {
                    "off" => LatencyMode::Off,
                    "auto" => LatencyMode::Auto,
                    "always" => LatencyMode::Always,
                    other => return Err(anyhow!("Unknown latency mode {:?}", other)),
                });
                i += 2;
            }
            "--interlaced" => {
                options.source.interlaced = true;
                options.double_rate = true;
                i += 1;
            }
            "--no-audio" => {
                options.audio = false;
                i += 1;
            }
            "--seek" => {
                let (target, at) = timed(value(args, i, flag)?, flag)?;
                options.schedule.push((at, Action::Seek(target)));
                i += 2;
            }
            "--speed" => {
                let (speed, at) = timed(value(args, i, flag)?, flag)?;
                options.schedule.push((at, Action::Speed(speed)));
                i += 2;
            }
            "--reverse-at" => {
                let at = value(args, i, flag)?.parse()?;
                options.schedule.push((at, Action::Reverse(true)));
                i += 2;
            }
            "--forward-at" => {
                let at = value(args, i, flag)?.parse()?;
                options.schedule.push((at, Action::Reverse(false)));
                i += 2;
            }
            "--pause-at" => {
                let at = value(args, i, flag)?.parse()?;
                options.schedule.push((at, Action::Pause(true)));
                i += 2;
            }
            "--resume-at" => {
                let at = value(args, i, flag)?.parse()?;
                options.schedule.push((at, Action::Pause(false)));
                i += 2;
            }
            other => return Err(anyhow!("Unknown argument {:?}", other)),
        }
    }
    options.schedule.sort_by_key(|(at, _)| *at);
    Ok(options)
}

// ============================================================================
// Report
// ============================================================================

#[derive(Serialize)]
struct Report {
    version: &'static str,
    final_state: PlaybackState,
    position_ms: i64,
    stats: PlaybackStats,
    events: BTreeMap<&'static str, u64>,
    errors: Vec<String>,
}

fn event_name(event: &PlaybackEvent) -> &'static str {
    match event {
        PlaybackEvent::BufferingStarted => "buffering_started",
        PlaybackEvent::BufferingCompleted { .. } => "buffering_completed",
        PlaybackEvent::PlaybackStopped { .. } => "playback_stopped",
        PlaybackEvent::SeekCompleted { .. } => "seek_completed",
        PlaybackEvent::StateChanged { .. } => "state_changed",
        PlaybackEvent::SpeedChanged { .. } => "speed_changed",
        PlaybackEvent::Ended => "ended",
    }
}

fn event_error(event: &PlaybackEvent) -> Option<String> {
    match event {
        PlaybackEvent::BufferingCompleted { error: Some(e) }
        | PlaybackEvent::PlaybackStopped { error: Some(e) }
        | PlaybackEvent::SeekCompleted { error: Some(e), .. } => Some(e.to_string()),
        _ => None,
    }
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cadence=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let options = parse_args(&args)?;
    tracing::info!("Cadence Simulator v{}", cadence_core::VERSION);

    let mut config = match &options.config {
        Some(path) => SyncConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SyncConfig::default(),
    };
    config.audio.enabled &= options.audio;
    config.policy.double_rate |= options.double_rate;
    if let Some(mode) = options.latency {
        config.latency.mode = mode;
    }

    let time: Arc<dyn TimeSource> = Arc::new(SystemTimeSource::new());
    let decoder = SyntheticDecoder::spawn(options.source.clone(), time.clone());
    let renderer = Arc::new(RecordingRenderer::new());
    let sink: Option<Arc<dyn AudioSink>> = options.audio.then(|| {
        Arc::new(SimulatedAudioSink::new(time.clone(), options.device_delay_us)) as Arc<dyn AudioSink>
    });

    let mut player = Player::open(config, time, decoder.clone(), renderer, sink)?;
    let events = player.subscribe();

    let started = Instant::now();
    let run_for = Duration::from_millis(options.run_ms);
    let mut schedule = options.schedule.iter().peekable();
    let mut counts: BTreeMap<&'static str, u64> = BTreeMap::new();
    let mut errors = Vec::new();

    while started.elapsed() < run_for {
        let now_ms = started.elapsed().as_millis() as u64;
        while let Some((_, action)) = schedule.next_if(|(at, _)| *at <= now_ms) {
            tracing::info!("t={} ms: {:?}", now_ms, action);
            match *action {
                Action::Seek(ms) => {
                    player.seek(SeekRequest::accurate(ms))?;
                }
                Action::Reverse(on) => {
                    if let Err(e) = player.set_reverse(on) {
                        tracing::warn!("reverse rejected: {}", e);
                    }
                }
                Action::Pause(true) => player.pause(),
                Action::Pause(false) => player.play(),
                Action::Speed(speed) => player.set_speed(speed),
            }
        }

        if let Ok(event) = events.recv_timeout(Duration::from_millis(10)) {
            *counts.entry(event_name(&event)).or_default() += 1;
            if let Some(err) = event_error(&event) {
                errors.push(err);
            }
            if matches!(event, PlaybackEvent::PlaybackStopped { .. }) {
                break;
            }
        }
    }

    let final_state = player.state();
    let position_ms = player.position_ms();
    player.stop();
    decoder.shutdown();
    for event in events.try_iter() {
        *counts.entry(event_name(&event)).or_default() += 1;
    }

    let report = Report {
        version: cadence_core::VERSION,
        final_state,
        position_ms,
        stats: player.stats(),
        events: counts,
        errors,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
