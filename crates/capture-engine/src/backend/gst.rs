//! `ximagesrc ! appsink` grabber, enabled with the `gstreamer` feature.

use std::sync::{Arc, OnceLock};

use gst::prelude::*;
use gstreamer as gst;
use image::RgbaImage;
use spanrec_common::error::{SpanrecError, SpanrecResult};
use spanrec_platform_core::{DisplayTopology, VirtualDesktopRect};

use crate::frame::crop_desktop;
use crate::source::ScreenGrabber;

const FIRST_FRAME_TIMEOUT_SECS: u64 = 5;

fn init_gstreamer() -> SpanrecResult<()> {
    static GST_INIT: OnceLock<Result<(), String>> = OnceLock::new();
    let init_res = GST_INIT.get_or_init(|| gst::init().map_err(|e| e.to_string()));
    match init_res {
        Ok(()) => Ok(()),
        Err(e) => Err(SpanrecError::platform(format!(
            "Failed to initialize GStreamer: {e}"
        ))),
    }
}

/// `ximagesrc` takes inclusive end coordinates and cannot address
/// negative offsets.
fn ximage_region_fragment(rect: &VirtualDesktopRect) -> SpanrecResult<String> {
    if rect.left() < 0 || rect.top() < 0 {
        return Err(SpanrecError::capture_source(format!(
            "ximagesrc cannot capture {rect}: negative root coordinates"
        )));
    }
    Ok(format!(
        " startx={} starty={} endx={} endy={}",
        rect.left(),
        rect.top(),
        rect.right() - 1,
        rect.bottom() - 1
    ))
}

/// Pulls whole-desktop RGBA frames from an appsink that only ever holds the
/// newest one.
pub struct XImageGrabber {
    pipeline: gst::Pipeline,
    sink: gst::Element,
    desktop: VirtualDesktopRect,
    fps: u32,
    last: Option<Arc<RgbaImage>>,
}

impl XImageGrabber {
    pub fn new(topology: &DisplayTopology, fps: u32) -> SpanrecResult<Self> {
        Self::build(topology.bounds(), fps.max(1))
    }

    fn build(desktop: VirtualDesktopRect, fps: u32) -> SpanrecResult<Self> {
        init_gstreamer()?;
        let region = ximage_region_fragment(&desktop)?;
        // `use-damage=false` ensures full frame delivery.
        let launch = format!(
            "ximagesrc use-damage=false show-pointer=true{region} ! videoconvert ! videorate ! video/x-raw,format=RGBA,framerate={fps}/1 ! appsink name=sink max-buffers=1 drop=true sync=false"
        );

        let element = gst::parse::launch(&launch).map_err(|e| {
            SpanrecError::capture_source(format!("Failed to build ximagesrc pipeline: {e}"))
        })?;
        let pipeline = element.dynamic_cast::<gst::Pipeline>().map_err(|_| {
            SpanrecError::capture_source("Launch string did not produce a pipeline")
        })?;
        let sink = pipeline
            .by_name("sink")
            .ok_or_else(|| SpanrecError::capture_source("appsink missing from pipeline"))?;

        pipeline.set_state(gst::State::Playing).map_err(|e| {
            SpanrecError::capture_source(format!("Failed to start ximagesrc pipeline: {e:?}"))
        })?;
        tracing::info!(desktop = %desktop, fps, "ximagesrc pipeline playing");

        Ok(Self {
            pipeline,
            sink,
            desktop,
            fps,
            last: None,
        })
    }

    fn pull(&self, timeout: gst::ClockTime) -> SpanrecResult<Option<RgbaImage>> {
        let sample = self
            .sink
            .emit_by_name::<Option<gst::Sample>>("try-pull-sample", &[&timeout.nseconds()]);
        let Some(sample) = sample else {
            return Ok(None);
        };
        let buffer = sample
            .buffer()
            .ok_or_else(|| SpanrecError::capture_source("Sample without buffer"))?;
        let map = buffer
            .map_readable()
            .map_err(|_| SpanrecError::capture_source("Failed to map frame buffer"))?;
        let (width, height) = self.desktop.size();
        RgbaImage::from_raw(width, height, map.as_slice().to_vec())
            .map(Some)
            .ok_or_else(|| {
                SpanrecError::capture_source(format!(
                    "Frame buffer of {} bytes does not match {}",
                    map.size(),
                    self.desktop
                ))
            })
    }

    fn frame(&mut self) -> SpanrecResult<Arc<RgbaImage>> {
        if let Some(frame) = self.pull(gst::ClockTime::ZERO)? {
            self.last = Some(Arc::new(frame));
        }
        if let Some(last) = &self.last {
            return Ok(last.clone());
        }
        let frame = self
            .pull(gst::ClockTime::from_seconds(FIRST_FRAME_TIMEOUT_SECS))?
            .ok_or_else(|| SpanrecError::capture_source("ximagesrc produced no frame"))?;
        let frame = Arc::new(frame);
        self.last = Some(frame.clone());
        Ok(frame)
    }
}

impl ScreenGrabber for XImageGrabber {
    fn grab(&mut self, area: &VirtualDesktopRect) -> SpanrecResult<RgbaImage> {
        let frame = self.frame()?;
        crop_desktop(&frame, &self.desktop, area)
    }

    fn topology_changed(&mut self, topology: &DisplayTopology) -> SpanrecResult<()> {
        if topology.bounds() != self.desktop {
            *self = Self::build(topology.bounds(), self.fps)?;
        }
        Ok(())
    }
}

impl Drop for XImageGrabber {
    fn drop(&mut self) {
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            tracing::warn!(error = ?e, "Failed to stop ximagesrc pipeline");
        }
    }
}
