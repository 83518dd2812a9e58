//! Playback statistics shared by the scheduling and audio threads.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::frame_queue::StreamType;

#[derive(Default)]
struct StreamCounters {
    presented: AtomicU64,
    dropped: AtomicU64,
}

/// Lock-free counters, snapshotted into [`PlaybackStats`].
#[derive(Default)]
pub struct SyncStats {
    streams: [StreamCounters; 4],
    second_fields: AtomicU64,
    out_of_order: AtomicU64,
    rebuffers: AtomicU64,
    seeks_executed: AtomicU64,
    seeks_failed: AtomicU64,
    audio_resyncs: AtomicU64,
    audio_desyncs: AtomicU64,
    audio_exhausted: AtomicU64,
    latency_flushes: AtomicU64,
    speed_changes: AtomicU64,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn presented(&self, stream: StreamType) {
        self.streams[stream.index()]
            .presented
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped(&self, stream: StreamType, n: u64) {
        self.streams[stream.index()]
            .dropped
            .fetch_add(n, Ordering::Relaxed);
    }

    pub fn second_field(&self) {
        self.second_fields.fetch_add(1, Ordering::Relaxed);
    }

    pub fn out_of_order(&self) {
        self.out_of_order.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rebuffer(&self) {
        self.rebuffers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn seek_executed(&self) {
        self.seeks_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn seek_failed(&self) {
        self.seeks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn audio_resync(&self) {
        self.audio_resyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn audio_desync(&self) {
        self.audio_desyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn audio_exhausted(&self) {
        self.audio_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn latency_flush(&self) {
        self.latency_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn speed_change(&self) {
        self.speed_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, seeks_discarded: u64, speed: f64) -> PlaybackStats {
        let stream = |s: StreamType| StreamStats {
            presented: self.streams[s.index()].presented.load(Ordering::Relaxed),
            dropped: self.streams[s.index()].dropped.load(Ordering::Relaxed),
        };
        PlaybackStats {
            video: stream(StreamType::Video),
            audio: stream(StreamType::Audio),
            subtitle: stream(StreamType::Subtitle),
            data: stream(StreamType::Data),
            second_fields: self.second_fields.load(Ordering::Relaxed),
            out_of_order: self.out_of_order.load(Ordering::Relaxed),
            rebuffers: self.rebuffers.load(Ordering::Relaxed),
            seeks_executed: self.seeks_executed.load(Ordering::Relaxed),
            seeks_failed: self.seeks_failed.load(Ordering::Relaxed),
            seeks_discarded,
            audio_resyncs: self.audio_resyncs.load(Ordering::Relaxed),
            audio_desyncs: self.audio_desyncs.load(Ordering::Relaxed),
            audio_exhausted: self.audio_exhausted.load(Ordering::Relaxed),
            latency_flushes: self.latency_flushes.load(Ordering::Relaxed),
            speed_changes: self.speed_changes.load(Ordering::Relaxed),
            speed,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub presented: u64,
    pub dropped: u64,
}

/// Point-in-time copy of the playback counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlaybackStats {
    pub video: StreamStats,
    pub audio: StreamStats,
    pub subtitle: StreamStats,
    pub data: StreamStats,
    pub second_fields: u64,
    pub out_of_order: u64,
    pub rebuffers: u64,
    pub seeks_executed: u64,
    pub seeks_failed: u64,
    pub seeks_discarded: u64,
    pub audio_resyncs: u64,
    pub audio_desyncs: u64,
    pub audio_exhausted: u64,
    pub latency_flushes: u64,
    pub speed_changes: u64,
    pub speed: f64,
}

impl PlaybackStats {
    pub fn stream(&self, stream: StreamType) -> StreamStats {
        match stream {
            StreamType::Video => self.video,
            StreamType::Audio => self.audio,
            StreamType::Subtitle => self.subtitle,
            StreamType::Data => self.data,
        }
    }
}
