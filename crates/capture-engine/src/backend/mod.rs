use std::path::Path;
use std::sync::Arc;

use spanrec_common::error::SpanrecResult;
use spanrec_platform_core::{DisplayTopology, MonitorDescriptor};

use crate::audio::AudioSource;
use crate::frame::OutputGeometry;
use crate::mux::Muxer;
use crate::sink::VideoEncoder;
use crate::source::{ScreenGrabber, WindowTracker};

/// Platform-specific capture capabilities the session is assembled from.
pub trait CaptureBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Detect available monitors in virtual desktop coordinates.
    fn detect_monitors(&self) -> SpanrecResult<Vec<MonitorDescriptor>>;

    /// Open a pixel grabber covering `topology`.
    fn open_grabber(
        &self,
        topology: &DisplayTopology,
        fps: u32,
    ) -> SpanrecResult<Box<dyn ScreenGrabber>>;

    /// Follow the window with the given platform id.
    fn open_window_tracker(&self, window_id: &str) -> SpanrecResult<Box<dyn WindowTracker>>;

    /// Open the system output monitor. Fails with
    /// `NoLoopbackDeviceAvailable` when there is none.
    fn open_loopback(&self, sample_rate: u32, channels: u16)
        -> SpanrecResult<Box<dyn AudioSource>>;

    /// Start an encoder writing `geometry`-sized frames to `path`.
    fn open_encoder(
        &self,
        path: &Path,
        geometry: OutputGeometry,
        fps: u32,
        codec: &str,
    ) -> SpanrecResult<Box<dyn VideoEncoder>>;

    fn muxer(&self) -> Arc<dyn Muxer>;
}

pub mod ffmpeg;
#[cfg(feature = "gstreamer")]
pub mod gst;
pub mod linux;

pub use linux::LinuxBackend;

/// Get the platform-specific backend.
pub fn get_backend() -> SpanrecResult<Arc<dyn CaptureBackend>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(LinuxBackend::new()))
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(spanrec_common::error::SpanrecError::unsupported(
            "spanrec only supports Linux/X11 desktops",
        ))
    }
}
