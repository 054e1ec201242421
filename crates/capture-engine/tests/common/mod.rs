//! In-memory backend for driving whole sessions without a display.

#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::{Rgba, RgbaImage};
use spanrec_capture_engine::audio::{AudioChunk, AudioSource, InterruptHandle};
use spanrec_capture_engine::backend::CaptureBackend;
use spanrec_capture_engine::frame::OutputGeometry;
use spanrec_capture_engine::mux::{MuxPlan, MuxReport, MuxRequest, Muxer};
use spanrec_capture_engine::sink::VideoEncoder;
use spanrec_capture_engine::source::{ScreenGrabber, WindowTracker};
use spanrec_capture_engine::SessionConfig;
use spanrec_common::error::{SpanrecError, SpanrecResult};
use spanrec_platform_core::{DisplayTopology, MonitorDescriptor, VirtualDesktopRect};

pub fn rect(x: i32, y: i32, w: u32, h: u32) -> VirtualDesktopRect {
    VirtualDesktopRect::new(x, y, w, h).unwrap()
}

pub fn side_by_side() -> Vec<MonitorDescriptor> {
    vec![
        MonitorDescriptor::new("DP-1", rect(0, 0, 1920, 1080), true),
        MonitorDescriptor::new("HDMI-1", rect(1920, 0, 1920, 1080), false),
    ]
}

/// Red and green carry the low byte of the desktop x and y coordinate.
pub fn desktop_pixel(x: i64, y: i64) -> Rgba<u8> {
    Rgba([x.rem_euclid(256) as u8, y.rem_euclid(256) as u8, 0x55, 255])
}

pub fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("spanrec-it-{}-{name}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

pub fn session_config(dir: &Path, capture_audio: bool) -> SessionConfig {
    SessionConfig {
        output_dir: dir.to_path_buf(),
        base_name: Some("take".into()),
        fps: 30,
        capture_audio,
        audio_stop_grace_ms: 200,
        ..SessionConfig::default()
    }
}

#[derive(Default)]
pub struct Recorded {
    pub grabbed: Mutex<Vec<VirtualDesktopRect>>,
    pub frame_sizes: Mutex<Vec<(u32, u32)>>,
    pub first_frame: Mutex<Option<RgbaImage>>,
    pub last_frame: Mutex<Option<RgbaImage>>,
    pub mux_requests: Mutex<Vec<MuxRequest>>,
    pub grabs: AtomicU64,
}

impl Recorded {
    pub fn frames_encoded(&self) -> u64 {
        self.frame_sizes.lock().unwrap().len() as u64
    }
}

pub struct SyntheticBackend {
    pub monitors: Mutex<Vec<MonitorDescriptor>>,
    pub audio_available: bool,
    pub grab_delay: Duration,
    /// Grabs after this many succeed fail forever.
    pub fail_after: Option<u64>,
    /// Silence before the loopback delivers its first chunk.
    pub audio_delay: Duration,
    /// Frames after this many are refused by the encoder.
    pub encoder_fails_after: Option<u64>,
    pub mux_fails: bool,
    pub recorded: Arc<Recorded>,
}

impl SyntheticBackend {
    pub fn new(monitors: Vec<MonitorDescriptor>) -> Self {
        Self {
            monitors: Mutex::new(monitors),
            audio_available: true,
            grab_delay: Duration::from_millis(1),
            fail_after: None,
            audio_delay: Duration::ZERO,
            encoder_fails_after: None,
            mux_fails: false,
            recorded: Arc::new(Recorded::default()),
        }
    }

    pub fn without_audio(mut self) -> Self {
        self.audio_available = false;
        self
    }

    pub fn with_grab_delay(mut self, delay: Duration) -> Self {
        self.grab_delay = delay;
        self
    }

    pub fn failing_after(mut self, grabs: u64) -> Self {
        self.fail_after = Some(grabs);
        self
    }

    pub fn with_audio_delay(mut self, delay: Duration) -> Self {
        self.audio_delay = delay;
        self
    }

    pub fn failing_encoder_after(mut self, frames: u64) -> Self {
        self.encoder_fails_after = Some(frames);
        self
    }

    pub fn with_failing_mux(mut self) -> Self {
        self.mux_fails = true;
        self
    }

    pub fn set_monitors(&self, monitors: Vec<MonitorDescriptor>) {
        *self.monitors.lock().unwrap() = monitors;
    }
}

impl CaptureBackend for SyntheticBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn detect_monitors(&self) -> SpanrecResult<Vec<MonitorDescriptor>> {
        let monitors = self.monitors.lock().unwrap().clone();
        if monitors.is_empty() {
            return Err(SpanrecError::NoDisplayFound);
        }
        Ok(monitors)
    }

    fn open_grabber(
        &self,
        _topology: &DisplayTopology,
        _fps: u32,
    ) -> SpanrecResult<Box<dyn ScreenGrabber>> {
        Ok(Box::new(PatternGrabber {
            delay: self.grab_delay,
            fail_after: self.fail_after,
            recorded: self.recorded.clone(),
        }))
    }

    fn open_window_tracker(&self, window_id: &str) -> SpanrecResult<Box<dyn WindowTracker>> {
        Ok(Box::new(FixedWindow {
            id: window_id.to_string(),
            rect: rect(100, 100, 400, 300),
        }))
    }

    fn open_loopback(
        &self,
        sample_rate: u32,
        channels: u16,
    ) -> SpanrecResult<Box<dyn AudioSource>> {
        if !self.audio_available {
            return Err(SpanrecError::no_loopback("no monitor source in test backend"));
        }
        Ok(Box::new(ToneSource {
            sample_rate,
            channels,
            start_delay: self.audio_delay,
            frames_read: 0,
            interrupted: Arc::new(AtomicBool::new(false)),
        }))
    }

    fn open_encoder(
        &self,
        path: &Path,
        geometry: OutputGeometry,
        _fps: u32,
        _codec: &str,
    ) -> SpanrecResult<Box<dyn VideoEncoder>> {
        Ok(Box::new(MemoryEncoder {
            geometry,
            file: File::create(path)?,
            encoded: 0,
            fails_after: self.encoder_fails_after,
            recorded: self.recorded.clone(),
        }))
    }

    fn muxer(&self) -> Arc<dyn Muxer> {
        Arc::new(RecordingMuxer {
            fails: self.mux_fails,
            recorded: self.recorded.clone(),
        })
    }
}

struct PatternGrabber {
    delay: Duration,
    fail_after: Option<u64>,
    recorded: Arc<Recorded>,
}

impl ScreenGrabber for PatternGrabber {
    fn grab(&mut self, area: &VirtualDesktopRect) -> SpanrecResult<RgbaImage> {
        std::thread::sleep(self.delay);
        let grabs = self.recorded.grabs.fetch_add(1, Ordering::SeqCst);
        if self.fail_after.is_some_and(|limit| grabs >= limit) {
            return Err(SpanrecError::capture_source("display went away"));
        }
        self.recorded.grabbed.lock().unwrap().push(*area);
        let (left, top) = (area.left(), area.top());
        Ok(RgbaImage::from_fn(area.width(), area.height(), |px, py| {
            desktop_pixel(left + px as i64, top + py as i64)
        }))
    }
}

struct FixedWindow {
    id: String,
    rect: VirtualDesktopRect,
}

impl WindowTracker for FixedWindow {
    fn window_rect(&mut self) -> SpanrecResult<VirtualDesktopRect> {
        Ok(self.rect)
    }

    fn describe(&self) -> String {
        self.id.clone()
    }
}

/// 10 ms chunks of a constant level, paced in real time, after an optional
/// silent start.
struct ToneSource {
    sample_rate: u32,
    channels: u16,
    start_delay: Duration,
    frames_read: u64,
    interrupted: Arc<AtomicBool>,
}

impl AudioSource for ToneSource {
    fn read_next(&mut self) -> SpanrecResult<Option<AudioChunk>> {
        if self.interrupted.load(Ordering::SeqCst) {
            return Ok(None);
        }
        if self.frames_read == 0 && !self.start_delay.is_zero() {
            std::thread::sleep(self.start_delay);
        }
        std::thread::sleep(Duration::from_millis(10));
        let frames = (self.sample_rate / 100) as u64;
        let chunk = AudioChunk {
            samples: vec![0.25; (frames * self.channels as u64) as usize],
            sample_rate: self.sample_rate,
            channels: self.channels,
            timestamp_ns: (self.frames_read * 1_000_000_000 / self.sample_rate as u64) as i64,
        };
        self.frames_read += frames;
        Ok(Some(chunk))
    }

    fn name(&self) -> String {
        "tone".into()
    }

    fn interrupt_handle(&self) -> Option<InterruptHandle> {
        let interrupted = self.interrupted.clone();
        Some(Arc::new(move || interrupted.store(true, Ordering::SeqCst)))
    }
}

/// Keeps frames in memory and leaves one byte per frame at the interim
/// video path, so kept artifacts can be checked on disk.
struct MemoryEncoder {
    geometry: OutputGeometry,
    file: File,
    encoded: u64,
    fails_after: Option<u64>,
    recorded: Arc<Recorded>,
}

impl VideoEncoder for MemoryEncoder {
    fn encode(&mut self, frame: &RgbaImage) -> SpanrecResult<()> {
        assert!(self.geometry.matches(frame), "sink handed over a mis-sized frame");
        if self.fails_after.is_some_and(|limit| self.encoded >= limit) {
            return Err(SpanrecError::sink_write("No space left on device"));
        }
        self.file.write_all(&[0])?;
        self.encoded += 1;
        self.recorded
            .frame_sizes
            .lock()
            .unwrap()
            .push(frame.dimensions());
        let mut first = self.recorded.first_frame.lock().unwrap();
        if first.is_none() {
            *first = Some(frame.clone());
        }
        *self.recorded.last_frame.lock().unwrap() = Some(frame.clone());
        Ok(())
    }

    fn finish(&mut self) -> SpanrecResult<()> {
        self.file.flush()?;
        Ok(())
    }
}

struct RecordingMuxer {
    fails: bool,
    recorded: Arc<Recorded>,
}

impl Muxer for RecordingMuxer {
    fn combine(&self, request: &MuxRequest) -> SpanrecResult<MuxReport> {
        let plan = MuxPlan::new(request)?;
        self.recorded
            .mux_requests
            .lock()
            .unwrap()
            .push(request.clone());
        if self.fails {
            return Err(SpanrecError::mux("ffmpeg exited with status 1: moov atom not found"));
        }
        Ok(MuxReport {
            output_path: request.output_path.clone(),
            duration_secs: plan.video_duration_secs,
            audio: plan.audio,
        })
    }
}
