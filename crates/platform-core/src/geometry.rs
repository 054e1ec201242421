//! Rectangles in virtual-desktop coordinates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use spanrec_common::error::{SpanrecError, SpanrecResult};

/// A non-empty rectangle in virtual-desktop pixels.
///
/// The origin may be negative (a monitor left of or above the primary).
/// Edges are exposed as `i64` so `x + width` can never overflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RectParts", into = "RectParts")]
pub struct VirtualDesktopRect {
    x: i32,
    y: i32,
    width: u32,
    height: u32,
}

#[derive(Serialize, Deserialize)]
struct RectParts {
    x: i32,
    y: i32,
    width: u32,
    height: u32,
}

impl TryFrom<RectParts> for VirtualDesktopRect {
    type Error = SpanrecError;

    fn try_from(parts: RectParts) -> SpanrecResult<Self> {
        Self::new(parts.x, parts.y, parts.width, parts.height)
    }
}

impl From<VirtualDesktopRect> for RectParts {
    fn from(rect: VirtualDesktopRect) -> Self {
        Self {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
        }
    }
}

impl VirtualDesktopRect {
    /// Build a rect from its origin and size.
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> SpanrecResult<Self> {
        if width == 0 || height == 0 {
            return Err(SpanrecError::invalid_region(format!(
                "Region must be non-empty, got {width}x{height} at ({x},{y})"
            )));
        }
        if width > i32::MAX as u32 || height > i32::MAX as u32 {
            return Err(SpanrecError::invalid_region(format!(
                "Region size {width}x{height} is out of range"
            )));
        }
        Ok(Self {
            x,
            y,
            width,
            height,
        })
    }

    /// Build a rect from two opposite corners of a drag, in any order.
    pub fn from_corners(x0: i32, y0: i32, x1: i32, y1: i32) -> SpanrecResult<Self> {
        Self::from_edges(
            (x0 as i64).min(x1 as i64),
            (y0 as i64).min(y1 as i64),
            (x0 as i64).max(x1 as i64),
            (y0 as i64).max(y1 as i64),
        )
    }

    /// Build a rect from exclusive edges.
    pub fn from_edges(left: i64, top: i64, right: i64, bottom: i64) -> SpanrecResult<Self> {
        let x = i32::try_from(left)
            .map_err(|_| SpanrecError::invalid_region(format!("Left edge {left} out of range")))?;
        let y = i32::try_from(top)
            .map_err(|_| SpanrecError::invalid_region(format!("Top edge {top} out of range")))?;
        let width = u32::try_from(right - left).map_err(|_| {
            SpanrecError::invalid_region(format!("Horizontal extent {left}..{right} is invalid"))
        })?;
        let height = u32::try_from(bottom - top).map_err(|_| {
            SpanrecError::invalid_region(format!("Vertical extent {top}..{bottom} is invalid"))
        })?;
        Self::new(x, y, width, height)
    }

    pub fn x(&self) -> i32 {
        self.x
    }

    pub fn y(&self) -> i32 {
        self.y
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn left(&self) -> i64 {
        self.x as i64
    }

    pub fn top(&self) -> i64 {
        self.y as i64
    }

    /// Exclusive right edge.
    pub fn right(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    /// Exclusive bottom edge.
    pub fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Overlapping part of two rects, if any.
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        let left = self.left().max(other.left());
        let top = self.top().max(other.top());
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right <= left || bottom <= top {
            return None;
        }
        Self::from_edges(left, top, right, bottom).ok()
    }

    pub fn intersects(&self, other: &Self) -> bool {
        self.intersection(other).is_some()
    }

    /// Whether `other` lies entirely inside `self`.
    pub fn contains_rect(&self, other: &Self) -> bool {
        other.left() >= self.left()
            && other.top() >= self.top()
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    pub fn contains_point(&self, x: i64, y: i64) -> bool {
        x >= self.left() && x < self.right() && y >= self.top() && y < self.bottom()
    }

    /// Smallest rect covering both. Fails when the combined extent does not
    /// fit a rect.
    pub fn union(&self, other: &Self) -> SpanrecResult<Self> {
        let left = self.left().min(other.left());
        let top = self.top().min(other.top());
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        Self::from_edges(left, top, right, bottom)
    }

    /// Offset of this rect's origin relative to `origin`'s origin.
    pub fn offset_from(&self, origin: &Self) -> (i64, i64) {
        (self.left() - origin.left(), self.top() - origin.top())
    }
}

impl fmt::Display for VirtualDesktopRect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{},{}", self.width, self.height, self.x, self.y)
    }
}

/// Parses `X,Y,WIDTH,HEIGHT`.
impl FromStr for VirtualDesktopRect {
    type Err = SpanrecError;

    fn from_str(s: &str) -> SpanrecResult<Self> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if parts.len() != 4 {
            return Err(SpanrecError::invalid_region(format!(
                "Expected X,Y,WIDTH,HEIGHT, got {s:?}"
            )));
        }
        let parse_i32 = |v: &str| {
            v.parse::<i32>()
                .map_err(|e| SpanrecError::invalid_region(format!("Bad coordinate {v:?}: {e}")))
        };
        let parse_u32 = |v: &str| {
            v.parse::<u32>()
                .map_err(|e| SpanrecError::invalid_region(format!("Bad size {v:?}: {e}")))
        };
        Self::new(
            parse_i32(parts[0])?,
            parse_i32(parts[1])?,
            parse_u32(parts[2])?,
            parse_u32(parts[3])?,
        )
    }
}
