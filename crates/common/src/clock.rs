//! Clock and timing utilities for stream synchronization.
//!
//! Every spanrec stream is anchored to the moment recording started.
//! This module provides:
//! - The recording epoch (monotonic + wall clock)
//! - Pluggable time sources so tick-driven code can run deterministically
//! - The fixed-cadence tick clock that governs video timing
//! - Drift measurement between streams

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A recording clock that provides monotonic timestamps relative to
/// a fixed epoch (the moment recording started).
#[derive(Debug, Clone)]
pub struct RecordingClock {
    /// The instant recording started.
    epoch: Instant,

    /// Wall-clock time at epoch (RFC 3339 string).
    epoch_wall: String,
}

impl RecordingClock {
    /// Create a new recording clock anchored to now.
    pub fn start() -> Self {
        Self {
            epoch: Instant::now(),
            epoch_wall: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Get nanoseconds elapsed since recording start.
    pub fn elapsed_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Get seconds elapsed since recording start.
    pub fn elapsed_secs(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// Wall-clock time at recording start.
    pub fn epoch_wall(&self) -> &str {
        &self.epoch_wall
    }

    /// The underlying epoch instant.
    pub fn epoch(&self) -> Instant {
        self.epoch
    }

    /// Convert an elapsed nanosecond value to seconds.
    pub fn ns_to_secs(ns: u64) -> f64 {
        ns as f64 / 1_000_000_000.0
    }

    /// Convert seconds to nanoseconds.
    pub fn secs_to_ns(secs: f64) -> u64 {
        (secs * 1_000_000_000.0) as u64
    }
}

/// Source of "now" for tick-driven code.
///
/// Production code uses [`SystemTimeSource`]; tests drive a
/// [`ManualTimeSource`] so cadence behavior is reproducible.
pub trait TimeSource: Send + Sync + fmt::Debug {
    /// Nanoseconds since this source's epoch.
    fn now_ns(&self) -> u64;

    /// Block until `now_ns() >= deadline_ns`.
    fn sleep_until_ns(&self, deadline_ns: u64);
}

/// Monotonic wall time.
#[derive(Debug, Clone)]
pub struct SystemTimeSource {
    epoch: Instant,
}

impl SystemTimeSource {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Share the epoch of an existing recording clock.
    pub fn from_clock(clock: &RecordingClock) -> Self {
        Self {
            epoch: clock.epoch(),
        }
    }
}

impl Default for SystemTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for SystemTimeSource {
    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn sleep_until_ns(&self, deadline_ns: u64) {
        let now = self.now_ns();
        if deadline_ns > now {
            std::thread::sleep(Duration::from_nanos(deadline_ns - now));
        }
    }
}

/// Deterministic time: only moves when told to, or when someone sleeps.
#[derive(Debug, Clone, Default)]
pub struct ManualTimeSource {
    now: Arc<AtomicU64>,
}

impl ManualTimeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward by `ns`.
    pub fn advance_ns(&self, ns: u64) {
        self.now.fetch_add(ns, Ordering::SeqCst);
    }

    /// Jump to an absolute time. Never moves backwards.
    pub fn set_ns(&self, ns: u64) {
        self.now.fetch_max(ns, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep_until_ns(&self, deadline_ns: u64) {
        self.now.fetch_max(deadline_ns, Ordering::SeqCst);
    }
}

/// Result of waiting for a tick boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickWait {
    /// Tick index that was waited for.
    pub tick: u64,
    /// Scheduled deadline of that tick (ns since epoch).
    pub deadline_ns: u64,
    /// Whole intervals by which the deadline had already passed.
    pub late_ticks: u64,
}

/// Fixed-cadence tick clock. Tick `n` is due at `n * interval`.
///
/// The tick clock is the authority for video timing: frame `n` of the
/// output always represents tick `n`, no matter how long capturing it took.
#[derive(Clone)]
pub struct TickClock {
    fps: u32,
    interval_ns: u64,
    time: Arc<dyn TimeSource>,
}

impl fmt::Debug for TickClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TickClock")
            .field("fps", &self.fps)
            .field("interval_ns", &self.interval_ns)
            .finish()
    }
}

impl TickClock {
    /// Create a clock ticking at `fps` on the given time source.
    pub fn new(fps: u32, time: Arc<dyn TimeSource>) -> Self {
        let fps = fps.max(1);
        Self {
            fps,
            interval_ns: 1_000_000_000 / fps as u64,
            time,
        }
    }

    /// Real-time clock starting now.
    pub fn realtime(fps: u32) -> Self {
        Self::new(fps, Arc::new(SystemTimeSource::new()))
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    /// Target interval in nanoseconds.
    pub fn interval_ns(&self) -> u64 {
        self.interval_ns
    }

    pub fn now_ns(&self) -> u64 {
        self.time.now_ns()
    }

    /// Scheduled deadline of tick `tick`.
    pub fn deadline_ns(&self, tick: u64) -> u64 {
        tick.saturating_mul(self.interval_ns)
    }

    /// Number of ticks whose deadline has been reached.
    pub fn ticks_elapsed(&self) -> u64 {
        self.now_ns() / self.interval_ns + 1
    }

    /// Block until tick `tick` is due. Returns immediately if it already is.
    pub fn wait_for(&self, tick: u64) -> TickWait {
        let deadline_ns = self.deadline_ns(tick);
        let now = self.time.now_ns();
        if now < deadline_ns {
            self.time.sleep_until_ns(deadline_ns);
            return TickWait {
                tick,
                deadline_ns,
                late_ticks: 0,
            };
        }

        TickWait {
            tick,
            deadline_ns,
            late_ticks: (now - deadline_ns) / self.interval_ns,
        }
    }

    /// Nominal duration of `frames` frames at this cadence, in seconds.
    pub fn frames_to_secs(&self, frames: u64) -> f64 {
        frames as f64 / self.fps as f64
    }
}

/// Drift measurement between two streams.
#[derive(Debug, Clone, Copy)]
pub struct DriftMeasurement {
    /// Timestamp in the reference stream (ns).
    pub reference_ns: u64,
    /// Timestamp in the measured stream (ns).
    pub measured_ns: u64,
}

impl DriftMeasurement {
    /// Drift in nanoseconds (positive = measured is ahead).
    pub fn drift_ns(&self) -> i64 {
        self.measured_ns as i64 - self.reference_ns as i64
    }

    /// Drift in milliseconds.
    pub fn drift_ms(&self) -> f64 {
        self.drift_ns() as f64 / 1_000_000.0
    }

    /// Whether drift exceeds an acceptable threshold.
    pub fn exceeds_threshold_ms(&self, threshold_ms: f64) -> bool {
        self.drift_ms().abs() > threshold_ms
    }
}
