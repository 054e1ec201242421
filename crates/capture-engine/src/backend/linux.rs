use std::path::Path;
use std::sync::Arc;

use spanrec_common::error::{SpanrecError, SpanrecResult};
use spanrec_platform_core::{
    DisplayServer, DisplayTopology, MonitorDescriptor, MonitorProvider, VirtualDesktopRect,
};
use spanrec_platform_linux::{
    detect_display_server, find_loopback_source, query_window_rect, XrandrMonitorProvider,
};

use crate::audio::AudioSource;
use crate::backend::ffmpeg::{FfmpegEncoder, FfmpegLoopbackSource};
use crate::backend::CaptureBackend;
use crate::frame::OutputGeometry;
use crate::mux::{FfmpegMuxer, Muxer};
use crate::sink::VideoEncoder;
use crate::source::{ScreenGrabber, WindowTracker};

/// X11 desktops: `xrandr` layout, `ffmpeg` grabbing and encoding, and the
/// PulseAudio monitor source for loopback.
pub struct LinuxBackend {
    display_server: DisplayServer,
    monitors: XrandrMonitorProvider,
}

impl LinuxBackend {
    pub fn new() -> Self {
        let display_server = detect_display_server();
        tracing::info!(%display_server, "Detected display server on Linux backend");
        if display_server == DisplayServer::Wayland {
            tracing::warn!("Wayland session detected; capture goes through XWayland and may only see X clients");
        }
        Self {
            display_server,
            monitors: XrandrMonitorProvider,
        }
    }

    pub fn display_server(&self) -> DisplayServer {
        self.display_server
    }
}

impl Default for LinuxBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBackend for LinuxBackend {
    fn name(&self) -> &'static str {
        "linux-x11"
    }

    fn detect_monitors(&self) -> SpanrecResult<Vec<MonitorDescriptor>> {
        if std::env::var_os("DISPLAY").is_none() {
            return Err(SpanrecError::NoDisplayFound);
        }
        self.monitors.detect_monitors()
    }

    fn open_grabber(
        &self,
        topology: &DisplayTopology,
        fps: u32,
    ) -> SpanrecResult<Box<dyn ScreenGrabber>> {
        #[cfg(feature = "gstreamer")]
        {
            Ok(Box::new(crate::backend::gst::XImageGrabber::new(topology, fps)?))
        }
        #[cfg(not(feature = "gstreamer"))]
        {
            Ok(Box::new(crate::backend::ffmpeg::X11GrabGrabber::new(
                topology, fps,
            )))
        }
    }

    fn open_window_tracker(&self, window_id: &str) -> SpanrecResult<Box<dyn WindowTracker>> {
        let tracker = XWindowTracker {
            window_id: window_id.to_string(),
        };
        // Fail fast on ids that do not resolve.
        query_window_rect(window_id)?;
        Ok(Box::new(tracker))
    }

    fn open_loopback(
        &self,
        sample_rate: u32,
        channels: u16,
    ) -> SpanrecResult<Box<dyn AudioSource>> {
        let device = find_loopback_source()?;
        Ok(Box::new(FfmpegLoopbackSource::open(
            &device.name,
            sample_rate,
            channels,
        )?))
    }

    fn open_encoder(
        &self,
        path: &Path,
        geometry: OutputGeometry,
        fps: u32,
        codec: &str,
    ) -> SpanrecResult<Box<dyn VideoEncoder>> {
        Ok(Box::new(FfmpegEncoder::open(path, geometry, fps, codec)?))
    }

    fn muxer(&self) -> Arc<dyn Muxer> {
        Arc::new(FfmpegMuxer)
    }
}

/// Reads an X11 window's bounds with `xwininfo`.
pub struct XWindowTracker {
    window_id: String,
}

impl WindowTracker for XWindowTracker {
    fn window_rect(&mut self) -> SpanrecResult<VirtualDesktopRect> {
        query_window_rect(&self.window_id)
    }

    fn describe(&self) -> String {
        self.window_id.clone()
    }
}
