//! Video Renderer Interface
//!
//! Frame presentation (GPU upload, shaders, color space) is owned by the
//! renderer. The synchronizer only decides *when* a frame is shown.

use parking_lot::Mutex;
use serde::Serialize;

use crate::frame_queue::{Frame, StreamType};

/// Renderer-side counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FrameStatistics {
    pub presented: u64,
    pub second_fields: u64,
    pub failed: u64,
    pub overlays: u64,
}

pub trait Renderer: Send + Sync {
    /// Show a single frame outside the presenting loop (paused seek,
    /// data frames)
    fn present(&self, frame: &Frame) -> bool;

    /// Show a video frame from the presenting loop
    fn render_play(&self, frame: &Frame, second_field: bool) -> bool;

    fn create_overlay_texture(&self, subtitle: &Frame);

    fn clear_overlay_texture(&self);

    fn frame_statistics(&self) -> FrameStatistics;
}

/// How a recorded frame reached the renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentKind {
    Present,
    Play,
    SecondField,
    Overlay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentedFrame {
    pub stream: StreamType,
    pub pts_us: i64,
    pub kind: PresentKind,
}

/// Renderer that keeps a log of everything shown.
///
/// Used by the simulator and by tests.
#[derive(Default)]
pub struct RecordingRenderer {
    log: Mutex<Vec<PresentedFrame>>,
    stats: Mutex<FrameStatistics>,
    overlay_visible: Mutex<bool>,
}

impl RecordingRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> Vec<PresentedFrame> {
        self.log.lock().clone()
    }

    /// Timestamps of frames shown by the presenting loop (first fields only)
    pub fn played_video(&self) -> Vec<i64> {
        self.log
            .lock()
            .iter()
            .filter(|p| p.stream == StreamType::Video && p.kind == PresentKind::Play)
            .map(|p| p.pts_us)
            .collect()
    }

    pub fn overlay_visible(&self) -> bool {
        *self.overlay_visible.lock()
    }

    fn record(&self, frame: &Frame, kind: PresentKind) {
        self.log.lock().push(PresentedFrame {
            stream: frame.stream,
            pts_us: frame.pts_us,
            kind,
        });
    }
}

impl Renderer for RecordingRenderer {
    fn present(&self, frame: &Frame) -> bool {
        self.record(frame, PresentKind::Present);
        self.stats.lock().presented += 1;
        true
    }

    fn render_play(&self, frame: &Frame, second_field: bool) -> bool {
        let kind = if second_field {
            PresentKind::SecondField
        } else {
            PresentKind::Play
        };
        self.record(frame, kind);
        let mut stats = self.stats.lock();
        if second_field {
            stats.second_fields += 1;
        } else {
            stats.presented += 1;
        }
        true
    }

    fn create_overlay_texture(&self, subtitle: &Frame) {
        self.record(subtitle, PresentKind::Overlay);
        self.stats.lock().overlays += 1;
        *self.overlay_visible.lock() = true;
    }

    fn clear_overlay_texture(&self) {
        *self.overlay_visible.lock() = false;
    }

    fn frame_statistics(&self) -> FrameStatistics {
        *self.stats.lock()
    }
}
