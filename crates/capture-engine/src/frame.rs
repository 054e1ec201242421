//! Captured frames and the fixed output geometry they are fitted to.

use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use serde::Serialize;
use spanrec_common::error::{SpanrecError, SpanrecResult};
use spanrec_platform_core::VirtualDesktopRect;

/// One tick's worth of pixels.
///
/// Moved, never cloned, from the capture worker to the writer worker.
#[derive(Debug)]
pub struct CaptureFrame {
    pub pixels: RgbaImage,
    /// Region the pixels were taken from.
    pub captured_rect: VirtualDesktopRect,
    /// Scheduled time of the tick this frame represents.
    pub timestamp_ns: u64,
    /// Tick index, starting at 0.
    pub sequence: u64,
    /// Repeated from the previous tick instead of freshly grabbed.
    pub duplicate: bool,
}

impl CaptureFrame {
    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }
}

/// The frame size the video track is committed to for the whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct OutputGeometry {
    width: u32,
    height: u32,
}

impl OutputGeometry {
    /// Round down to even dimensions (4:2:0 chroma needs them), minimum 2.
    pub fn from_dimensions(width: u32, height: u32) -> Self {
        Self {
            width: (width & !1).max(2),
            height: (height & !1).max(2),
        }
    }

    pub fn from_rect(rect: &VirtualDesktopRect) -> Self {
        Self::from_dimensions(rect.width(), rect.height())
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Size of one RGBA frame in bytes.
    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    pub fn matches(&self, pixels: &RgbaImage) -> bool {
        pixels.dimensions() == (self.width, self.height)
    }

    /// Stretch `pixels` to this geometry. Aspect ratio is not preserved and
    /// nothing is letterboxed. Returns whether a resize happened.
    pub fn fit(&self, pixels: RgbaImage) -> (RgbaImage, bool) {
        if self.matches(&pixels) {
            return (pixels, false);
        }
        (
            imageops::resize(&pixels, self.width, self.height, FilterType::Triangle),
            true,
        )
    }
}

impl std::fmt::Display for OutputGeometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Canvas of `rect`'s size, filled with `fill`, with each grabbed piece
/// pasted at its offset inside `rect`.
pub fn compose<I>(rect: &VirtualDesktopRect, pieces: I, fill: Rgba<u8>) -> SpanrecResult<RgbaImage>
where
    I: IntoIterator<Item = (VirtualDesktopRect, RgbaImage)>,
{
    let mut canvas = RgbaImage::from_pixel(rect.width(), rect.height(), fill);
    for (area, pixels) in pieces {
        if pixels.dimensions() != area.size() {
            return Err(SpanrecError::capture_source(format!(
                "Grabber returned {}x{} for area {area}",
                pixels.width(),
                pixels.height()
            )));
        }
        let (dx, dy) = area.offset_from(rect);
        imageops::replace(&mut canvas, &pixels, dx, dy);
    }
    Ok(canvas)
}

/// Cut `area` out of a full-desktop frame whose top-left is `desktop.x/y`.
pub fn crop_desktop(
    desktop_frame: &RgbaImage,
    desktop: &VirtualDesktopRect,
    area: &VirtualDesktopRect,
) -> SpanrecResult<RgbaImage> {
    if desktop_frame.dimensions() != desktop.size() {
        return Err(SpanrecError::capture_source(format!(
            "Desktop frame is {}x{}, expected {}",
            desktop_frame.width(),
            desktop_frame.height(),
            desktop
        )));
    }
    if !desktop.contains_rect(area) {
        return Err(SpanrecError::capture_source(format!(
            "Area {area} is outside the captured desktop {desktop}"
        )));
    }
    let (x, y) = area.offset_from(desktop);
    Ok(imageops::crop_imm(desktop_frame, x as u32, y as u32, area.width(), area.height()).to_image())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rect(x: i32, y: i32, w: u32, h: u32) -> VirtualDesktopRect {
        VirtualDesktopRect::new(x, y, w, h).unwrap()
    }

    #[test]
    fn geometry_rounds_odd_sizes_down() {
        let g = OutputGeometry::from_dimensions(1921, 1081);
        assert_eq!((g.width(), g.height()), (1920, 1080));
        let tiny = OutputGeometry::from_dimensions(1, 1);
        assert_eq!((tiny.width(), tiny.height()), (2, 2));
    }

    #[test]
    fn fit_stretches_without_letterbox() {
        let g = OutputGeometry::from_dimensions(40, 20);
        let (out, resized) = g.fit(RgbaImage::from_pixel(10, 30, Rgba([9, 9, 9, 255])));
        assert!(resized);
        assert_eq!(out.dimensions(), (40, 20));
        // Every pixel comes from the source; no bars.
        assert!(out.pixels().all(|p| *p == Rgba([9, 9, 9, 255])));

        let (same, resized) = g.fit(RgbaImage::new(40, 20));
        assert!(!resized);
        assert_eq!(same.dimensions(), (40, 20));
    }

    #[test]
    fn compose_fills_uncovered_area() {
        let target = rect(-10, 0, 20, 10);
        let piece = rect(0, 0, 10, 10);
        let red = Rgba([255, 0, 0, 255]);
        let fill = Rgba([1, 2, 3, 255]);
        let out = compose(&target, [(piece, RgbaImage::from_pixel(10, 10, red))], fill).unwrap();

        assert_eq!(*out.get_pixel(0, 0), fill);
        assert_eq!(*out.get_pixel(9, 9), fill);
        assert_eq!(*out.get_pixel(10, 0), red);
        assert_eq!(*out.get_pixel(19, 9), red);
    }

    #[test]
    fn compose_rejects_mis_sized_pieces() {
        let target = rect(0, 0, 10, 10);
        let err = compose(
            &target,
            [(rect(0, 0, 5, 5), RgbaImage::new(4, 5))],
            Rgba([0, 0, 0, 255]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("Grabber returned"));
    }

    #[test]
    fn crop_translates_negative_desktop_origin() {
        let desktop = rect(-4, 0, 8, 2);
        let mut frame = RgbaImage::new(8, 2);
        frame.put_pixel(4, 1, Rgba([7, 7, 7, 7]));

        let out = crop_desktop(&frame, &desktop, &rect(0, 1, 2, 1)).unwrap();
        assert_eq!(out.dimensions(), (2, 1));
        assert_eq!(*out.get_pixel(0, 0), Rgba([7, 7, 7, 7]));

        assert!(crop_desktop(&frame, &desktop, &rect(3, 0, 2, 2)).is_err());
    }

    proptest! {
        #[test]
        fn geometry_is_even_and_never_larger(w in 1u32..8000, h in 1u32..8000) {
            let g = OutputGeometry::from_dimensions(w, h);
            prop_assert_eq!(g.width() % 2, 0);
            prop_assert_eq!(g.height() % 2, 0);
            prop_assert!(g.width() <= w.max(2));
            prop_assert!(g.height() <= h.max(2));
            prop_assert!(w.max(2) - g.width() <= 1);
        }
    }
}
