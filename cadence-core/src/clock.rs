//! Playback Clock
//!
//! Single source of truth for presentation time. Maps wall-clock time from a
//! [`TimeSource`] onto the presentation timeline:
//!
//! ```text
//! elapsed = start_pts + wall_elapsed * speed     (forward)
//! elapsed = start_pts - wall_elapsed * speed     (reverse)
//! ```
//!
//! Rebasing is the only permitted discontinuity and happens under a write
//! lock, so readers always see a consistent segment.

use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const MIN_SPEED: f64 = 0.25;
pub const MAX_SPEED: f64 = 4.0;

/// Clamp a requested speed into the supported range.
pub fn clamp_speed(speed: f64) -> f64 {
    if speed.is_nan() {
        return 1.0;
    }
    speed.clamp(MIN_SPEED, MAX_SPEED)
}

// ============================================================================
// Wakeup
// ============================================================================

/// Interruptible sleep primitive shared by every waiting loop.
///
/// Seeks, stops and pause requests call [`Wakeup::notify`] so that a sleeping
/// scheduler re-checks its inputs without waiting out the full interval.
pub struct Wakeup {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl Wakeup {
    pub fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        *self.generation.lock() += 1;
        self.cond.notify_all();
    }

    /// Wait until notified or `timeout` passes. Returns true if notified.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut generation = self.generation.lock();
        let seen = *generation;
        while *generation == seen {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            self.cond.wait_for(&mut generation, remaining);
        }
        true
    }
}

impl Default for Wakeup {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Time Sources
// ============================================================================

/// Monotonic wall-clock provider.
pub trait TimeSource: Send + Sync {
    /// Microseconds since an arbitrary fixed origin.
    fn now_us(&self) -> i64;

    /// Sleep for up to `duration`, returning early when `wakeup` fires.
    fn sleep(&self, duration: Duration, wakeup: &Wakeup);
}

/// Real monotonic time backed by [`Instant`].
pub struct SystemTimeSource {
    origin: Instant,
}

impl SystemTimeSource {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for SystemTimeSource {
    fn now_us(&self) -> i64 {
        self.origin.elapsed().as_micros() as i64
    }

    fn sleep(&self, duration: Duration, wakeup: &Wakeup) {
        if duration.is_zero() {
            return;
        }
        wakeup.wait_for(duration);
    }
}

/// Virtual time that only moves when told to. Sleeping advances it, which
/// makes scheduling loops fully deterministic in tests and simulations.
pub struct ManualTimeSource {
    now_us: AtomicI64,
}

impl ManualTimeSource {
    pub fn new() -> Self {
        Self {
            now_us: AtomicI64::new(0),
        }
    }

    pub fn advance(&self, us: i64) {
        if us > 0 {
            self.now_us.fetch_add(us, Ordering::SeqCst);
        }
    }

    pub fn set(&self, us: i64) {
        self.now_us.store(us, Ordering::SeqCst);
    }
}

impl Default for ManualTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for ManualTimeSource {
    fn now_us(&self) -> i64 {
        self.now_us.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration, _wakeup: &Wakeup) {
        self.advance(duration.as_micros() as i64);
        std::thread::yield_now();
    }
}

// ============================================================================
// Playback Clock
// ============================================================================

/// Timeline direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Direction {
    Forward,
    Reverse,
}

impl Direction {
    pub fn is_reverse(self) -> bool {
        self == Direction::Reverse
    }
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    start_pts_us: i64,
    origin_us: i64,
    speed: f64,
    direction: Direction,
    frozen: bool,
}

/// Presentation clock - single writer (scheduling thread), many readers.
pub struct PlaybackClock {
    time: Arc<dyn TimeSource>,
    segment: RwLock<Segment>,
    started: AtomicBool,
    /// Bumped on every discontinuity so followers (audio) know to resync
    generation: AtomicU64,
}

impl PlaybackClock {
    pub fn new(time: Arc<dyn TimeSource>) -> Self {
        Self {
            time,
            segment: RwLock::new(Segment {
                start_pts_us: 0,
                origin_us: 0,
                speed: 1.0,
                direction: Direction::Forward,
                frozen: true,
            }),
            started: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    /// Start running from `start_pts_us` at the current speed.
    pub fn start(&self, start_pts_us: i64) {
        let mut seg = self.segment.write();
        seg.start_pts_us = start_pts_us;
        seg.origin_us = self.time.now_us();
        seg.frozen = false;
        self.started.store(true, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Current presentation time in microseconds.
    pub fn elapsed_us(&self) -> i64 {
        let seg = *self.segment.read();
        self.position_in(&seg)
    }

    pub fn elapsed_ms(&self) -> i64 {
        self.elapsed_us() / 1000
    }

    fn position_in(&self, seg: &Segment) -> i64 {
        if seg.frozen {
            return seg.start_pts_us;
        }
        let wall = (self.time.now_us() - seg.origin_us).max(0);
        let delta = (wall as f64 * seg.speed) as i64;
        match seg.direction {
            Direction::Forward => seg.start_pts_us + delta,
            Direction::Reverse => seg.start_pts_us - delta,
        }
    }

    /// Move the clock to a new anchor. Keeps direction and paused state.
    pub fn rebase(&self, start_pts_us: i64, speed: f64) {
        let direction = self.segment.read().direction;
        self.rebase_with_direction(start_pts_us, speed, direction);
    }

    pub fn rebase_with_direction(&self, start_pts_us: i64, speed: f64, direction: Direction) {
        let mut seg = self.segment.write();
        seg.start_pts_us = start_pts_us;
        seg.origin_us = self.time.now_us();
        seg.speed = clamp_speed(speed);
        seg.direction = direction;
        self.started.store(true, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Change speed without a timeline jump.
    pub fn set_speed(&self, speed: f64) {
        let mut seg = self.segment.write();
        let now = self.position_in(&seg);
        seg.start_pts_us = now;
        seg.origin_us = self.time.now_us();
        seg.speed = clamp_speed(speed);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Freeze at the current position.
    pub fn pause(&self) {
        let mut seg = self.segment.write();
        if seg.frozen {
            return;
        }
        seg.start_pts_us = self.position_in(&seg);
        seg.frozen = true;
    }

    /// Continue from the frozen position.
    pub fn resume(&self) {
        let mut seg = self.segment.write();
        if !seg.frozen {
            return;
        }
        seg.origin_us = self.time.now_us();
        seg.frozen = false;
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        !self.segment.read().frozen
    }

    pub fn speed(&self) -> f64 {
        self.segment.read().speed
    }

    pub fn direction(&self) -> Direction {
        self.segment.read().direction
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn manual_clock() -> (Arc<ManualTimeSource>, PlaybackClock) {
        let time = Arc::new(ManualTimeSource::new());
        let clock = PlaybackClock::new(time.clone());
        (time, clock)
    }

    #[test]
    fn elapsed_follows_speed() {
        let (time, clock) = manual_clock();
        clock.start(1_000_000);
        time.advance(100_000);
        assert_eq!(clock.elapsed_us(), 1_100_000);

        clock.set_speed(2.0);
        time.advance(100_000);
        assert_eq!(clock.elapsed_us(), 1_300_000);
    }

    #[test]
    fn unstarted_clock_reads_zero() {
        let (time, clock) = manual_clock();
        time.advance(50_000);
        assert!(!clock.is_started());
        assert_eq!(clock.elapsed_us(), 0);
    }

    #[test]
    fn speed_is_clamped() {
        let (_time, clock) = manual_clock();
        clock.rebase(0, 10.0);
        assert_eq!(clock.speed(), MAX_SPEED);
        clock.rebase(0, 0.01);
        assert_eq!(clock.speed(), MIN_SPEED);
        assert_eq!(clamp_speed(f64::NAN), 1.0);
    }

    #[test]
    fn reverse_runs_backwards() {
        let (time, clock) = manual_clock();
        clock.start(0);
        clock.rebase_with_direction(500_000, 1.0, Direction::Reverse);
        time.advance(200_000);
        assert_eq!(clock.elapsed_us(), 300_000);
        assert_eq!(clock.direction(), Direction::Reverse);
    }

    #[test]
    fn pause_freezes_and_resume_continues() {
        let (time, clock) = manual_clock();
        clock.start(0);
        time.advance(40_000);
        clock.pause();
        time.advance(500_000);
        assert_eq!(clock.elapsed_us(), 40_000);
        clock.resume();
        time.advance(10_000);
        assert_eq!(clock.elapsed_us(), 50_000);
    }

    #[test]
    fn rebase_bumps_generation() {
        let (_time, clock) = manual_clock();
        let g0 = clock.generation();
        clock.rebase(10, 1.0);
        assert!(clock.generation() > g0);
    }

    #[test]
    fn wakeup_interrupts_wait() {
        let wakeup = Arc::new(Wakeup::new());
        let waker = wakeup.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.notify();
        });
        let started = Instant::now();
        assert!(wakeup.wait_for(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }
}
