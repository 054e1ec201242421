//! Fixed-geometry, fixed-rate video sink.

use std::path::{Path, PathBuf};

use image::RgbaImage;
use serde::Serialize;
use spanrec_common::error::{SpanrecError, SpanrecResult};

use crate::frame::{CaptureFrame, OutputGeometry};

/// Turns RGBA frames into an encoded video file.
pub trait VideoEncoder: Send {
    /// Append one frame. Frames always match the sink's geometry.
    fn encode(&mut self, frame: &RgbaImage) -> SpanrecResult<()>;

    /// Flush and finalize the container.
    fn finish(&mut self) -> SpanrecResult<()>;
}

/// What a closed [`FrameSink`] produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameSinkSummary {
    pub path: PathBuf,
    pub geometry: OutputGeometry,
    pub fps: u32,
    /// Every frame handed to the encoder, gap fills included.
    pub frames_written: u64,
    pub frames_resized: u64,
    pub gap_fills: u64,
}

impl FrameSinkSummary {
    /// Video duration implied by the frame count.
    pub fn duration_secs(&self) -> f64 {
        self.frames_written as f64 / self.fps.max(1) as f64
    }
}

/// Writes frames in strict sequence order at a fixed geometry.
///
/// Frames of another size are stretched to the geometry. Sequence gaps
/// (frames dropped upstream) are filled by repeating the last written
/// frame, so frame `n` of the output is always tick `n`.
pub struct FrameSink {
    path: PathBuf,
    geometry: OutputGeometry,
    fps: u32,
    encoder: Box<dyn VideoEncoder>,
    next_sequence: u64,
    last_frame: Option<RgbaImage>,
    frames_written: u64,
    frames_resized: u64,
    gap_fills: u64,
    closed: bool,
}

impl FrameSink {
    pub fn open(
        path: impl Into<PathBuf>,
        geometry: OutputGeometry,
        fps: u32,
        encoder: Box<dyn VideoEncoder>,
    ) -> SpanrecResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        tracing::info!(path = %path.display(), %geometry, fps, "Frame sink opened");
        Ok(Self {
            path,
            geometry,
            fps: fps.max(1),
            encoder,
            next_sequence: 0,
            last_frame: None,
            frames_written: 0,
            frames_resized: 0,
            gap_fills: 0,
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn geometry(&self) -> OutputGeometry {
        self.geometry
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn write(&mut self, frame: CaptureFrame) -> SpanrecResult<()> {
        if self.closed {
            return Err(SpanrecError::sink_write("Frame sink is already closed"));
        }
        if frame.sequence < self.next_sequence {
            return Err(SpanrecError::sink_write(format!(
                "Frame {} arrived after frame {}",
                frame.sequence,
                self.next_sequence - 1
            )));
        }

        let (pixels, resized) = self.geometry.fit(frame.pixels);
        if resized {
            self.frames_resized += 1;
        }

        let missing = frame.sequence - self.next_sequence;
        if missing > 0 {
            tracing::warn!(
                missing,
                sequence = frame.sequence,
                "Frames missing before sequence; repeating last frame"
            );
            self.repeat(missing, &pixels)?;
        }

        self.encoder.encode(&pixels)?;
        self.frames_written += 1;
        self.next_sequence = frame.sequence + 1;
        self.last_frame = Some(pixels);
        Ok(())
    }

    /// Pad with repeats of the last frame until `total_frames` have been
    /// written. Used when the final ticks never reached the sink.
    pub fn fill_to(&mut self, total_frames: u64) -> SpanrecResult<()> {
        if self.closed || total_frames <= self.next_sequence {
            return Ok(());
        }
        let Some(last) = self.last_frame.take() else {
            return Ok(());
        };
        let missing = total_frames - self.next_sequence;
        tracing::warn!(missing, "Trailing frames missing; repeating last frame");
        let result = self.repeat(missing, &last);
        self.last_frame = Some(last);
        result?;
        self.next_sequence = total_frames;
        Ok(())
    }

    /// Finalize the container. Safe to call more than once.
    pub fn close(&mut self) -> SpanrecResult<FrameSinkSummary> {
        if !self.closed {
            self.closed = true;
            self.encoder.finish()?;
            tracing::info!(
                path = %self.path.display(),
                frames = self.frames_written,
                resized = self.frames_resized,
                gap_fills = self.gap_fills,
                "Frame sink closed"
            );
        }
        Ok(self.summary())
    }

    fn summary(&self) -> FrameSinkSummary {
        FrameSinkSummary {
            path: self.path.clone(),
            geometry: self.geometry,
            fps: self.fps,
            frames_written: self.frames_written,
            frames_resized: self.frames_resized,
            gap_fills: self.gap_fills,
        }
    }

    /// Encode `count` repeats, preferring the last written frame and
    /// falling back to `current` when nothing was written yet.
    fn repeat(&mut self, count: u64, current: &RgbaImage) -> SpanrecResult<()> {
        let filler = self.last_frame.as_ref().unwrap_or(current);
        for _ in 0..count {
            self.encoder.encode(filler)?;
        }
        self.frames_written += count;
        self.gap_fills += count;
        Ok(())
    }
}

impl Drop for FrameSink {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                tracing::warn!(error = %e, "Failed to finalize frame sink on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use spanrec_platform_core::VirtualDesktopRect;
    use std::sync::{Arc, Mutex};

    #[derive(Default, Clone)]
    struct MemoryEncoder {
        frames: Arc<Mutex<Vec<RgbaImage>>>,
        finished: Arc<Mutex<u32>>,
    }

    impl VideoEncoder for MemoryEncoder {
        fn encode(&mut self, frame: &RgbaImage) -> SpanrecResult<()> {
            self.frames.lock().unwrap().push(frame.clone());
            Ok(())
        }

        fn finish(&mut self) -> SpanrecResult<()> {
            *self.finished.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn frame(sequence: u64, w: u32, h: u32, shade: u8) -> CaptureFrame {
        CaptureFrame {
            pixels: RgbaImage::from_pixel(w, h, Rgba([shade, shade, shade, 255])),
            captured_rect: VirtualDesktopRect::new(0, 0, w, h).unwrap(),
            timestamp_ns: sequence * 33_333_333,
            sequence,
            duplicate: false,
        }
    }

    fn sink(encoder: &MemoryEncoder) -> FrameSink {
        let path = std::env::temp_dir().join("spanrec-frame-sink-test.mp4");
        FrameSink::open(
            path,
            OutputGeometry::from_dimensions(8, 4),
            30,
            Box::new(encoder.clone()),
        )
        .unwrap()
    }

    #[test]
    fn mismatched_frames_are_resized_to_geometry() {
        let encoder = MemoryEncoder::default();
        let mut sink = sink(&encoder);
        sink.write(frame(0, 8, 4, 10)).unwrap();
        sink.write(frame(1, 20, 20, 20)).unwrap();
        let summary = sink.close().unwrap();

        assert_eq!(summary.frames_written, 2);
        assert_eq!(summary.frames_resized, 1);
        assert!(encoder
            .frames
            .lock()
            .unwrap()
            .iter()
            .all(|f| f.dimensions() == (8, 4)));
    }

    #[test]
    fn gaps_repeat_the_last_written_frame() {
        let encoder = MemoryEncoder::default();
        let mut sink = sink(&encoder);
        sink.write(frame(0, 8, 4, 1)).unwrap();
        sink.write(frame(3, 8, 4, 2)).unwrap();
        let summary = sink.close().unwrap();

        assert_eq!(summary.frames_written, 4);
        assert_eq!(summary.gap_fills, 2);
        let shades: Vec<u8> = encoder
            .frames
            .lock()
            .unwrap()
            .iter()
            .map(|f| f.get_pixel(0, 0)[0])
            .collect();
        assert_eq!(shades, vec![1, 1, 1, 2]);
    }

    #[test]
    fn out_of_order_frames_are_rejected() {
        let encoder = MemoryEncoder::default();
        let mut sink = sink(&encoder);
        sink.write(frame(0, 8, 4, 1)).unwrap();
        sink.write(frame(1, 8, 4, 1)).unwrap();
        let err = sink.write(frame(1, 8, 4, 1)).unwrap_err();
        assert!(matches!(err, SpanrecError::SinkWrite { .. }));
        assert_eq!(sink.frames_written(), 2);
    }

    #[test]
    fn fill_to_pads_trailing_ticks() {
        let encoder = MemoryEncoder::default();
        let mut sink = sink(&encoder);
        sink.write(frame(0, 8, 4, 5)).unwrap();
        sink.fill_to(3).unwrap();
        sink.fill_to(2).unwrap();
        assert_eq!(sink.close().unwrap().frames_written, 3);
    }

    #[test]
    fn close_is_idempotent_and_blocks_further_writes() {
        let encoder = MemoryEncoder::default();
        let mut sink = sink(&encoder);
        sink.write(frame(0, 8, 4, 1)).unwrap();
        let first = sink.close().unwrap();
        let second = sink.close().unwrap();
        assert_eq!(first, second);
        assert_eq!(*encoder.finished.lock().unwrap(), 1);
        assert!(sink.write(frame(1, 8, 4, 1)).is_err());

        drop(sink);
        assert_eq!(*encoder.finished.lock().unwrap(), 1);
    }
}
