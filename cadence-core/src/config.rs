//! Synchronizer configuration.
//!
//! All thresholds are policy values, not semantic requirements: they were
//! tuned empirically and should be validated against real output hardware.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::clock::MAX_SPEED;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(String),
    #[error("Failed to parse config: {0}")]
    Parse(String),
    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

// ============================================================================
// Sync Policy
// ============================================================================

/// Per-frame scheduling thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncPolicy {
    /// Present frames within +/- this distance
    pub jitter_band_us: i64,
    /// Late frames up to this bound are dropped; later triggers rebuffering
    pub catch_up_bound_us: i64,
    /// Subtitle / data presentation window
    pub sideband_deadband_us: i64,
    /// Wake this much before a frame is due
    pub sleep_margin_us: i64,
    /// Longest single sleep before re-checking for seeks
    pub max_sleep_us: i64,
    /// How close to the last frame end counts as end of stream
    pub eos_tolerance_us: i64,
    /// Clock standing still this long while presenting is an error
    pub stall_timeout_ms: u64,
    /// Present interlaced frames twice (one per field)
    pub double_rate: bool,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            jitter_band_us: 3_000,
            catch_up_bound_us: 50_000,
            sideband_deadband_us: 30_000,
            sleep_margin_us: 1_000,
            max_sleep_us: 20_000,
            eos_tolerance_us: 40_000,
            stall_timeout_ms: 2_000,
            double_rate: false,
        }
    }
}

// ============================================================================
// Buffering
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferingConfig {
    /// Interval between readiness checks
    pub poll_interval_ms: u64,
    /// Give up waiting for the primary stream after this long
    pub timeout_ms: u64,
    /// Polls granted to the companion stream before going without it
    pub companion_retry_budget: u32,
    /// Extra pre-roll once the primary stream has a frame (0 = off)
    pub min_buffer_duration_ms: u64,
}

impl Default for BufferingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            timeout_ms: 5_000,
            companion_retry_budget: 3,
            min_buffer_duration_ms: 0,
        }
    }
}

// ============================================================================
// Audio
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub enabled: bool,
    /// Below this the sink is considered starved and audio resyncs
    pub low_watermark_us: i64,
    /// Resume feeding below this level
    pub min_play_buffer_us: i64,
    /// Stop feeding at this level
    pub max_play_buffer_us: i64,
    /// Decoded audio required before a resync commits
    pub min_lookahead_us: i64,
    /// Cumulative timestamp discontinuity tolerated while feeding
    pub max_desync_us: i64,
    /// Resync alignment window around the ideal feed time
    pub resync_tolerance_us: i64,
    pub poll_interval_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            low_watermark_us: 10_000,
            min_play_buffer_us: 40_000,
            max_play_buffer_us: 150_000,
            min_lookahead_us: 60_000,
            max_desync_us: 50_000,
            resync_tolerance_us: 10_000,
            poll_interval_ms: 5,
        }
    }
}

// ============================================================================
// Latency
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatencyMode {
    Off,
    /// Active when the decoder reports a live source
    Auto,
    Always,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    pub mode: LatencyMode,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    pub speed_change_interval_ms: u64,
    /// Above this speed the controller flushes instead
    pub max_speed: f64,
    /// 0 disables the limit
    pub max_video_frames: usize,
    /// 0 disables the limit
    pub max_packets: usize,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            mode: LatencyMode::Auto,
            min_latency_ms: 100,
            max_latency_ms: 300,
            speed_change_interval_ms: 1_000,
            max_speed: MAX_SPEED,
            max_video_frames: 0,
            max_packets: 0,
        }
    }
}

// ============================================================================
// Top Level
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Start presenting as soon as the first buffering completes
    pub auto_play: bool,
    pub policy: SyncPolicy,
    pub buffering: BufferingConfig,
    pub audio: AudioConfig,
    pub latency: LatencyConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_play: true,
            policy: SyncPolicy::default(),
            buffering: BufferingConfig::default(),
            audio: AudioConfig::default(),
            latency: LatencyConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_json_str(&content)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.policy;
        if p.jitter_band_us < 0 {
            return Err(invalid("policy.jitter_band_us", "must not be negative"));
        }
        if p.catch_up_bound_us <= p.jitter_band_us {
            return Err(invalid(
                "policy.catch_up_bound_us",
                "must exceed the jitter band",
            ));
        }
        if p.sideband_deadband_us < p.jitter_band_us {
            return Err(invalid(
                "policy.sideband_deadband_us",
                "must be at least the jitter band",
            ));
        }
        if p.sleep_margin_us < 0 || p.sleep_margin_us >= p.jitter_band_us.max(1) {
            return Err(invalid(
                "policy.sleep_margin_us",
                "must be non-negative and below the jitter band",
            ));
        }
        if p.max_sleep_us <= 0 {
            return Err(invalid("policy.max_sleep_us", "must be positive"));
        }

        if self.buffering.poll_interval_ms == 0 {
            return Err(invalid("buffering.poll_interval_ms", "must be positive"));
        }

        let a = &self.audio;
        if a.poll_interval_ms == 0 {
            return Err(invalid("audio.poll_interval_ms", "must be positive"));
        }
        if !(a.low_watermark_us <= a.min_play_buffer_us && a.min_play_buffer_us < a.max_play_buffer_us)
        {
            return Err(invalid(
                "audio",
                "watermarks must satisfy low <= min_play < max_play",
            ));
        }
        if a.max_desync_us <= 0 {
            return Err(invalid("audio.max_desync_us", "must be positive"));
        }

        let l = &self.latency;
        if l.min_latency_ms >= l.max_latency_ms {
            return Err(invalid(
                "latency.min_latency_ms",
                "must be below max_latency_ms",
            ));
        }
        if !(1.1..=MAX_SPEED).contains(&l.max_speed) {
            return Err(invalid(
                "latency.max_speed",
                format!("must be within [1.1, {}]", MAX_SPEED),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
