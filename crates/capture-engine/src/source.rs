//! Tick-driven capture sources.
//!
//! A [`CaptureSource`] produces exactly one [`CaptureFrame`] per tick of the
//! [`TickClock`]. When a tick cannot be served with fresh pixels (the worker
//! fell behind, or the grab failed) the previous frame is repeated so the
//! frame count always tracks the tick count.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use image::{Rgba, RgbaImage};
use serde::Serialize;
use spanrec_common::clock::TickClock;
use spanrec_common::error::{SpanrecError, SpanrecResult};
use spanrec_platform_core::{DisplayTopology, VirtualDesktopRect};

use crate::frame::{compose, CaptureFrame};

/// Grabs raw pixels for an area lying within a single monitor.
pub trait ScreenGrabber: Send {
    fn grab(&mut self, area: &VirtualDesktopRect) -> SpanrecResult<RgbaImage>;

    /// Called on the capture worker after the monitor layout changed.
    fn topology_changed(&mut self, _topology: &DisplayTopology) -> SpanrecResult<()> {
        Ok(())
    }
}

/// Reports the live bounds of a window being followed.
pub trait WindowTracker: Send {
    fn window_rect(&mut self) -> SpanrecResult<VirtualDesktopRect>;

    fn describe(&self) -> String;
}

/// Produces one frame per tick.
pub trait CaptureSource: Send {
    /// Block until the next tick and return its frame.
    fn capture_next(&mut self) -> SpanrecResult<CaptureFrame>;

    /// Swap the capture rectangle; observed by the very next tick.
    fn change_rect(&mut self, rect: VirtualDesktopRect) -> SpanrecResult<()>;

    fn active_rect(&self) -> VirtualDesktopRect;

    /// Shared handle the session uses to swap the rect while the source
    /// runs on another thread. `None` when the rect is not user-driven.
    fn region_handle(&self) -> Option<RegionHandle>;

    fn stats(&self) -> CaptureStats;

    fn name(&self) -> &'static str;
}

/// The current capture rectangle, shared between the session (writer) and
/// the capture worker (reader).
///
/// [`RegionHandle::change`] is the only way to move the rect, whether it is
/// called through [`CaptureSource::change_rect`] or on a handle the session
/// holds while the source runs on its worker.
#[derive(Debug, Clone)]
pub struct RegionHandle {
    rect: Arc<Mutex<VirtualDesktopRect>>,
    generation: Arc<AtomicU64>,
    topology: SharedTopology,
}

impl RegionHandle {
    pub fn new(rect: VirtualDesktopRect, topology: SharedTopology) -> Self {
        Self {
            rect: Arc::new(Mutex::new(rect)),
            generation: Arc::new(AtomicU64::new(0)),
            topology,
        }
    }

    pub fn get(&self) -> VirtualDesktopRect {
        *self.rect.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Swap in `rect` if any monitor shows part of it; otherwise keep the
    /// current rect. Returns the new generation number.
    pub fn change(&self, rect: VirtualDesktopRect) -> SpanrecResult<u64> {
        self.topology.with(|t| t.validate_capture_rect(&rect))?;
        *self.rect.lock().unwrap_or_else(|e| e.into_inner()) = rect;
        Ok(self.generation.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Number of swaps so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

/// Monitor layout shared between the session and the capture worker.
#[derive(Debug, Clone)]
pub struct SharedTopology {
    inner: Arc<RwLock<DisplayTopology>>,
    generation: Arc<AtomicU64>,
}

impl SharedTopology {
    pub fn new(topology: DisplayTopology) -> Self {
        Self {
            inner: Arc::new(RwLock::new(topology)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&DisplayTopology) -> R) -> R {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    pub fn snapshot(&self) -> DisplayTopology {
        self.with(Clone::clone)
    }

    pub fn replace(&self, topology: DisplayTopology) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = topology;
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

/// Knobs shared by both capture sources.
#[derive(Debug, Clone, Copy)]
pub struct CaptureOptions {
    /// RGBA for pixels no monitor backs.
    pub fill: Rgba<u8>,
    /// Consecutive failed grabs tolerated before giving up.
    pub retry_ticks: u32,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            fill: Rgba([0, 0, 0, 255]),
            retry_ticks: 30,
        }
    }
}

/// Counters for one capture source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    /// Ticks served, i.e. frames produced.
    pub ticks: u64,
    /// Frames built from fresh pixels.
    pub frames_grabbed: u64,
    /// Repeats emitted because the worker fell a full interval behind.
    pub duplicates_underrun: u64,
    /// Repeats emitted because the grab failed.
    pub duplicates_failed_grab: u64,
}

impl CaptureStats {
    pub fn duplicates(&self) -> u64 {
        self.duplicates_underrun + self.duplicates_failed_grab
    }
}

/// Tick bookkeeping common to every source.
struct FrameTicker {
    clock: TickClock,
    topology: SharedTopology,
    seen_topology: u64,
    grabber: Box<dyn ScreenGrabber>,
    options: CaptureOptions,
    next_tick: u64,
    previous: Option<(RgbaImage, VirtualDesktopRect)>,
    consecutive_failures: u32,
    stats: CaptureStats,
}

impl FrameTicker {
    fn new(
        clock: TickClock,
        topology: SharedTopology,
        grabber: Box<dyn ScreenGrabber>,
        options: CaptureOptions,
    ) -> Self {
        let seen_topology = topology.generation();
        Self {
            clock,
            topology,
            seen_topology,
            grabber,
            options,
            next_tick: 0,
            previous: None,
            consecutive_failures: 0,
            stats: CaptureStats::default(),
        }
    }

    /// Serve the next tick. `rect` is only consulted when fresh pixels are
    /// actually grabbed.
    fn next(&mut self, rect: impl FnOnce() -> VirtualDesktopRect) -> SpanrecResult<CaptureFrame> {
        let wait = self.clock.wait_for(self.next_tick);
        let sequence = self.next_tick;
        self.next_tick += 1;
        self.stats.ticks += 1;

        self.sync_topology();

        if wait.late_ticks >= 1 {
            if let Some(frame) = self.repeat_previous(sequence, wait.deadline_ns) {
                self.stats.duplicates_underrun += 1;
                tracing::trace!(sequence, late_ticks = wait.late_ticks, "Capture behind schedule; repeating frame");
                return Ok(frame);
            }
        }

        let rect = rect();
        match self.grab_composed(&rect) {
            Ok(pixels) => {
                if self.consecutive_failures > 0 {
                    tracing::info!(
                        failed_ticks = self.consecutive_failures,
                        "Screen grab recovered"
                    );
                }
                self.consecutive_failures = 0;
                self.stats.frames_grabbed += 1;
                self.previous = Some((pixels.clone(), rect));
                Ok(CaptureFrame {
                    pixels,
                    captured_rect: rect,
                    timestamp_ns: wait.deadline_ns,
                    sequence,
                    duplicate: false,
                })
            }
            Err(e) => {
                self.consecutive_failures += 1;
                if self.previous.is_none() {
                    return Err(SpanrecError::capture_source(format!(
                        "First frame could not be grabbed: {e}"
                    )));
                }
                if self.consecutive_failures > self.options.retry_ticks {
                    return Err(SpanrecError::capture_source(format!(
                        "Screen grab failed for {} consecutive ticks: {e}",
                        self.consecutive_failures
                    )));
                }
                if self.consecutive_failures == 1 {
                    tracing::warn!(error = %e, sequence, "Screen grab failed; repeating previous frame");
                }
                self.stats.duplicates_failed_grab += 1;
                self.repeat_previous(sequence, wait.deadline_ns)
                    .ok_or_else(|| SpanrecError::capture_source("No previous frame to repeat"))
            }
        }
    }

    fn repeat_previous(&self, sequence: u64, timestamp_ns: u64) -> Option<CaptureFrame> {
        self.previous.as_ref().map(|(pixels, rect)| CaptureFrame {
            pixels: pixels.clone(),
            captured_rect: *rect,
            timestamp_ns,
            sequence,
            duplicate: true,
        })
    }

    fn sync_topology(&mut self) {
        let generation = self.topology.generation();
        if generation == self.seen_topology {
            return;
        }
        self.seen_topology = generation;
        let topology = self.topology.snapshot();
        if let Err(e) = self.grabber.topology_changed(&topology) {
            tracing::warn!(error = %e, "Grabber could not adapt to new monitor layout");
        }
    }

    fn grab_composed(&mut self, rect: &VirtualDesktopRect) -> SpanrecResult<RgbaImage> {
        let areas: Vec<VirtualDesktopRect> = self.topology.with(|t| {
            t.monitors_intersecting(rect)
                .map(|(_, part)| part)
                .collect()
        });

        let mut pieces = Vec::with_capacity(areas.len());
        for area in areas {
            pieces.push((area, self.grabber.grab(&area)?));
        }
        compose(rect, pieces, self.options.fill)
    }
}

/// Captures a user-selected rectangle that the session may swap at any time.
pub struct RegionCapture {
    ticker: FrameTicker,
    region: RegionHandle,
}

impl RegionCapture {
    /// Fails with `CaptureSource` when `rect` lies entirely off-screen.
    pub fn open(
        rect: VirtualDesktopRect,
        topology: SharedTopology,
        grabber: Box<dyn ScreenGrabber>,
        clock: TickClock,
        options: CaptureOptions,
    ) -> SpanrecResult<Self> {
        topology.with(|t| t.validate_capture_rect(&rect))?;
        tracing::info!(rect = %rect, fps = clock.fps(), "Region capture opened");
        Ok(Self {
            region: RegionHandle::new(rect, topology.clone()),
            ticker: FrameTicker::new(clock, topology, grabber, options),
        })
    }
}

impl CaptureSource for RegionCapture {
    fn capture_next(&mut self) -> SpanrecResult<CaptureFrame> {
        let region = &self.region;
        self.ticker.next(|| region.get())
    }

    fn change_rect(&mut self, rect: VirtualDesktopRect) -> SpanrecResult<()> {
        self.region.change(rect).map(|_| ())
    }

    fn active_rect(&self) -> VirtualDesktopRect {
        self.region.get()
    }

    fn region_handle(&self) -> Option<RegionHandle> {
        Some(self.region.clone())
    }

    fn stats(&self) -> CaptureStats {
        self.ticker.stats
    }

    fn name(&self) -> &'static str {
        "region"
    }
}

/// Follows a window, re-reading its bounds every tick.
pub struct WindowCapture {
    ticker: FrameTicker,
    tracker: Box<dyn WindowTracker>,
    last_known: VirtualDesktopRect,
    lost: bool,
}

impl WindowCapture {
    pub fn open(
        mut tracker: Box<dyn WindowTracker>,
        topology: SharedTopology,
        grabber: Box<dyn ScreenGrabber>,
        clock: TickClock,
        options: CaptureOptions,
    ) -> SpanrecResult<Self> {
        let rect = tracker.window_rect().map_err(|e| {
            SpanrecError::capture_source(format!(
                "Cannot read bounds of window {}: {e}",
                tracker.describe()
            ))
        })?;
        topology.with(|t| t.validate_capture_rect(&rect))?;
        tracing::info!(window = %tracker.describe(), rect = %rect, "Window capture opened");
        Ok(Self {
            ticker: FrameTicker::new(clock, topology, grabber, options),
            tracker,
            last_known: rect,
            lost: false,
        })
    }

    fn poll_window(
        tracker: &mut dyn WindowTracker,
        last_known: &mut VirtualDesktopRect,
        lost: &mut bool,
    ) -> VirtualDesktopRect {
        match tracker.window_rect() {
            Ok(rect) => {
                if *lost {
                    tracing::info!(window = %tracker.describe(), rect = %rect, "Window bounds available again");
                }
                *lost = false;
                *last_known = rect;
            }
            Err(e) => {
                if !*lost {
                    tracing::warn!(
                        window = %tracker.describe(),
                        error = %e,
                        "Window bounds unavailable; reusing last known bounds"
                    );
                }
                *lost = true;
            }
        }
        *last_known
    }
}

impl CaptureSource for WindowCapture {
    fn capture_next(&mut self) -> SpanrecResult<CaptureFrame> {
        let tracker = self.tracker.as_mut();
        let last_known = &mut self.last_known;
        let lost = &mut self.lost;
        self.ticker
            .next(|| Self::poll_window(tracker, last_known, lost))
    }

    fn change_rect(&mut self, _rect: VirtualDesktopRect) -> SpanrecResult<()> {
        Err(SpanrecError::unsupported(
            "Region changes are not available while following a window",
        ))
    }

    fn active_rect(&self) -> VirtualDesktopRect {
        self.last_known
    }

    fn region_handle(&self) -> Option<RegionHandle> {
        None
    }

    fn stats(&self) -> CaptureStats {
        self.ticker.stats
    }

    fn name(&self) -> &'static str {
        "window"
    }
}
