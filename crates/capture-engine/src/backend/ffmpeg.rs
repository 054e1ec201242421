//! `ffmpeg` child processes for grabbing, loopback capture, and encoding.

use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use image::RgbaImage;
use spanrec_common::error::{SpanrecError, SpanrecResult};
use spanrec_platform_core::{DisplayTopology, VirtualDesktopRect};

use crate::audio::{AudioChunk, AudioSource, F32leChunkReader, InterruptHandle};
use crate::frame::{crop_desktop, OutputGeometry};
use crate::sink::VideoEncoder;
use crate::source::ScreenGrabber;

/// Sample frames per loopback chunk.
pub const LOOPBACK_CHUNK_FRAMES: usize = 1024;

const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(5);
const FIRST_FRAME_POLL: Duration = Duration::from_millis(5);

fn spawn_error(what: &str, e: std::io::Error) -> SpanrecError {
    if e.kind() == ErrorKind::NotFound {
        SpanrecError::platform(format!("ffmpeg not found in PATH (needed for {what})"))
    } else {
        SpanrecError::platform(format!("Failed to start ffmpeg for {what}: {e}"))
    }
}

fn stop_child(child: &mut Child) {
    if let Err(e) = child.kill() {
        if e.kind() != ErrorKind::InvalidInput {
            tracing::debug!(error = %e, "Failed to kill ffmpeg child");
        }
    }
    let _ = child.wait();
}

/// Streams the whole virtual desktop through `ffmpeg -f x11grab` and cuts
/// monitor areas out of the most recent frame.
///
/// X11 root-window coordinates are used as virtual desktop coordinates.
pub struct X11GrabGrabber {
    display: String,
    fps: u32,
    desktop: VirtualDesktopRect,
    stream: Option<DesktopStream>,
}

struct DesktopStream {
    child: Child,
    latest: Arc<Mutex<Option<Arc<RgbaImage>>>>,
    failure: Arc<Mutex<Option<String>>>,
    reader: Option<JoinHandle<()>>,
}

impl DesktopStream {
    fn spawn(display: &str, desktop: &VirtualDesktopRect, fps: u32) -> SpanrecResult<Self> {
        let input = format!("{display}+{},{}", desktop.x(), desktop.y());
        let size = format!("{}x{}", desktop.width(), desktop.height());
        tracing::info!(%input, %size, fps, "Starting x11grab desktop stream");

        let mut child = Command::new("ffmpeg")
            .args(["-hide_banner", "-loglevel", "error", "-f", "x11grab", "-draw_mouse", "1"])
            .args(["-framerate", &fps.to_string(), "-video_size", &size, "-i", &input])
            .args(["-f", "rawvideo", "-pix_fmt", "rgba", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| spawn_error("screen grabbing", e))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpanrecError::capture_source("Failed to capture x11grab stdout"))?;

        let latest = Arc::new(Mutex::new(None));
        let failure = Arc::new(Mutex::new(None));
        let (width, height) = desktop.size();
        let frame_bytes = width as usize * height as usize * 4;

        let reader = {
            let latest = latest.clone();
            let failure = failure.clone();
            std::thread::Builder::new()
                .name("spanrec-x11grab-reader".into())
                .spawn(move || loop {
                    let mut buf = vec![0u8; frame_bytes];
                    if let Err(e) = stdout.read_exact(&mut buf) {
                        *failure.lock().unwrap_or_else(|p| p.into_inner()) =
                            Some(format!("x11grab stream ended: {e}"));
                        return;
                    }
                    if let Some(frame) = RgbaImage::from_raw(width, height, buf) {
                        *latest.lock().unwrap_or_else(|p| p.into_inner()) = Some(Arc::new(frame));
                    }
                })
        };
        let reader = match reader {
            Ok(handle) => handle,
            Err(e) => {
                stop_child(&mut child);
                return Err(e.into());
            }
        };

        Ok(Self {
            child,
            latest,
            failure,
            reader: Some(reader),
        })
    }

    fn latest_frame(&self) -> SpanrecResult<Option<Arc<RgbaImage>>> {
        if let Some(message) = self.failure.lock().unwrap_or_else(|p| p.into_inner()).clone() {
            return Err(SpanrecError::capture_source(message));
        }
        Ok(self.latest.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }

    fn wait_first_frame(&self) -> SpanrecResult<Arc<RgbaImage>> {
        let deadline = Instant::now() + FIRST_FRAME_TIMEOUT;
        loop {
            if let Some(frame) = self.latest_frame()? {
                return Ok(frame);
            }
            if Instant::now() >= deadline {
                return Err(SpanrecError::capture_source(format!(
                    "x11grab produced no frame within {}s",
                    FIRST_FRAME_TIMEOUT.as_secs()
                )));
            }
            std::thread::sleep(FIRST_FRAME_POLL);
        }
    }
}

impl Drop for DesktopStream {
    fn drop(&mut self) {
        stop_child(&mut self.child);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

impl X11GrabGrabber {
    pub fn new(topology: &DisplayTopology, fps: u32) -> Self {
        Self {
            display: std::env::var("DISPLAY").unwrap_or_else(|_| ":0".to_string()),
            fps: fps.max(1),
            desktop: topology.bounds(),
            stream: None,
        }
    }

    fn frame(&mut self) -> SpanrecResult<Arc<RgbaImage>> {
        if self.stream.is_none() {
            let stream = DesktopStream::spawn(&self.display, &self.desktop, self.fps)?;
            let first = stream.wait_first_frame()?;
            self.stream = Some(stream);
            return Ok(first);
        }

        let result = match &self.stream {
            Some(stream) => stream.latest_frame(),
            None => Ok(None),
        };
        match result {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(SpanrecError::capture_source("x11grab has not produced a frame yet")),
            Err(e) => {
                // Restart on the next grab.
                self.stream = None;
                Err(e)
            }
        }
    }
}

impl ScreenGrabber for X11GrabGrabber {
    fn grab(&mut self, area: &VirtualDesktopRect) -> SpanrecResult<RgbaImage> {
        let frame = self.frame()?;
        crop_desktop(&frame, &self.desktop, area)
    }

    fn topology_changed(&mut self, topology: &DisplayTopology) -> SpanrecResult<()> {
        let bounds = topology.bounds();
        if bounds != self.desktop {
            tracing::info!(old = %self.desktop, new = %bounds, "Desktop bounds changed; restarting x11grab");
            self.desktop = bounds;
            self.stream = None;
        }
        Ok(())
    }
}

/// Reads a PulseAudio monitor source through `ffmpeg -f pulse`.
pub struct FfmpegLoopbackSource {
    device: String,
    child: Arc<Mutex<Child>>,
    reader: F32leChunkReader<ChildStdout>,
}

impl FfmpegLoopbackSource {
    pub fn open(device: &str, sample_rate: u32, channels: u16) -> SpanrecResult<Self> {
        let mut child = Command::new("ffmpeg")
            .args(["-hide_banner", "-loglevel", "error", "-f", "pulse", "-i", device])
            .args(["-ac", &channels.to_string(), "-ar", &sample_rate.to_string()])
            .args(["-f", "f32le", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| SpanrecError::no_loopback(spawn_error("loopback audio", e).to_string()))?;

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                stop_child(&mut child);
                return Err(SpanrecError::audio("Failed to capture loopback stdout"));
            }
        };

        tracing::info!(device, sample_rate, channels, "Loopback capture started");
        Ok(Self {
            device: device.to_string(),
            child: Arc::new(Mutex::new(child)),
            reader: F32leChunkReader::new(stdout, sample_rate, channels, LOOPBACK_CHUNK_FRAMES),
        })
    }
}

impl AudioSource for FfmpegLoopbackSource {
    fn read_next(&mut self) -> SpanrecResult<Option<AudioChunk>> {
        self.reader.read_chunk()
    }

    fn name(&self) -> String {
        format!("pulse:{}", self.device)
    }

    fn interrupt_handle(&self) -> Option<InterruptHandle> {
        let child = self.child.clone();
        Some(Arc::new(move || {
            // Killing the child closes the pipe the reader is blocked on.
            let mut child = child.lock().unwrap_or_else(|p| p.into_inner());
            if let Err(e) = child.kill() {
                tracing::debug!(error = %e, "Loopback child already gone");
            }
        }))
    }
}

impl Drop for FfmpegLoopbackSource {
    fn drop(&mut self) {
        stop_child(&mut self.child.lock().unwrap_or_else(|p| p.into_inner()));
    }
}

/// Arguments for encoding raw RGBA frames from stdin.
pub fn encoder_args(path: &Path, geometry: OutputGeometry, fps: u32, codec: &str) -> Vec<String> {
    let mut args: Vec<String> = [
        "-y", "-hide_banner", "-loglevel", "error", "-f", "rawvideo", "-pix_fmt", "rgba",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.extend([
        "-video_size".to_string(),
        geometry.to_string(),
        "-framerate".to_string(),
        fps.max(1).to_string(),
        "-i".to_string(),
        "-".to_string(),
        "-c:v".to_string(),
        codec.to_string(),
    ]);
    if codec == "libx264" {
        args.extend(["-preset", "veryfast", "-crf", "23"].iter().map(|s| s.to_string()));
    }
    args.extend([
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        path.to_string_lossy().into_owned(),
    ]);
    args
}

/// Pipes RGBA frames into an `ffmpeg` encoder process.
pub struct FfmpegEncoder {
    path: PathBuf,
    geometry: OutputGeometry,
    child: Child,
    stdin: Option<ChildStdin>,
    stderr_task: Option<JoinHandle<String>>,
}

impl FfmpegEncoder {
    pub fn open(path: &Path, geometry: OutputGeometry, fps: u32, codec: &str) -> SpanrecResult<Self> {
        let args = encoder_args(path, geometry, fps, codec);
        tracing::debug!(?args, "Starting ffmpeg encoder");

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error("encoding", e))?;

        let (Some(stdin), Some(stderr)) = (child.stdin.take(), child.stderr.take()) else {
            stop_child(&mut child);
            return Err(SpanrecError::sink_write("Failed to open ffmpeg encoder pipes"));
        };

        // Drain stderr concurrently to avoid ffmpeg blocking on a full pipe.
        let stderr_task = std::thread::spawn(move || {
            let mut output = String::new();
            if let Err(err) = BufReader::new(stderr).read_to_string(&mut output) {
                output.push_str(&format!("<failed to read ffmpeg stderr: {err}>"));
            }
            output
        });

        Ok(Self {
            path: path.to_path_buf(),
            geometry,
            child,
            stdin: Some(stdin),
            stderr_task: Some(stderr_task),
        })
    }

    fn stderr_output(&mut self) -> String {
        self.stderr_task
            .take()
            .and_then(|task| task.join().ok())
            .unwrap_or_default()
    }
}

impl VideoEncoder for FfmpegEncoder {
    fn encode(&mut self, frame: &RgbaImage) -> SpanrecResult<()> {
        if !self.geometry.matches(frame) {
            return Err(SpanrecError::sink_write(format!(
                "Encoder expects {} frames, got {}x{}",
                self.geometry,
                frame.width(),
                frame.height()
            )));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| SpanrecError::sink_write("Encoder already finished"))?;
        if let Err(e) = stdin.write_all(frame.as_raw()) {
            self.stdin = None;
            let _ = self.child.wait();
            let stderr = self.stderr_output();
            return Err(SpanrecError::sink_write(format!(
                "Writing to {} failed: {e}: {}",
                self.path.display(),
                stderr.trim()
            )));
        }
        Ok(())
    }

    fn finish(&mut self) -> SpanrecResult<()> {
        let Some(stdin) = self.stdin.take() else {
            return Ok(());
        };
        // Closing stdin signals end of stream.
        drop(stdin);
        let status = self
            .child
            .wait()
            .map_err(|e| SpanrecError::sink_write(format!("Failed to wait on ffmpeg encoder: {e}")))?;
        let stderr = self.stderr_output();
        if !status.success() {
            return Err(SpanrecError::sink_write(format!(
                "ffmpeg encoder failed (status {status}): {}",
                stderr.trim()
            )));
        }
        tracing::debug!(path = %self.path.display(), "Encoder finished");
        Ok(())
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        if self.stdin.is_some() {
            if let Err(e) = self.finish() {
                tracing::warn!(error = %e, "Encoder did not finish cleanly");
            }
        }
    }
}
