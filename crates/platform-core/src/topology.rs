//! Monitor discovery results and the virtual-desktop coordinate space.

use serde::{Deserialize, Serialize};
use spanrec_common::error::{SpanrecError, SpanrecResult};

use crate::geometry::VirtualDesktopRect;

/// One connected monitor, positioned in virtual-desktop pixels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorDescriptor {
    /// Output name (for example `DP-1`).
    pub id: String,
    pub rect: VirtualDesktopRect,
    pub is_primary: bool,
}

impl MonitorDescriptor {
    pub fn new(id: impl Into<String>, rect: VirtualDesktopRect, is_primary: bool) -> Self {
        Self {
            id: id.into(),
            rect,
            is_primary,
        }
    }
}

/// Something that can list the monitors currently attached.
pub trait MonitorProvider: Send + Sync {
    fn detect_monitors(&self) -> SpanrecResult<Vec<MonitorDescriptor>>;
}

/// A fixed monitor list, for tests and for callers that already know the layout.
impl MonitorProvider for Vec<MonitorDescriptor> {
    fn detect_monitors(&self) -> SpanrecResult<Vec<MonitorDescriptor>> {
        Ok(self.clone())
    }
}

/// Bounding rect covering every monitor. Fails with `NoDisplayFound` when
/// there are none and `InvalidRegion` when the layout is wider or taller
/// than a rect can describe.
pub fn virtual_desktop_bounds(monitors: &[MonitorDescriptor]) -> SpanrecResult<VirtualDesktopRect> {
    let mut iter = monitors.iter();
    let first = iter.next().ok_or(SpanrecError::NoDisplayFound)?.rect;
    iter.try_fold(first, |acc, m| acc.union(&m.rect))
}

/// Validated monitor layout.
///
/// Monitors never overlap. Gaps between them are legal and simply are not
/// backed by any pixels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisplayTopology {
    monitors: Vec<MonitorDescriptor>,
    bounds: VirtualDesktopRect,
}

impl DisplayTopology {
    /// Ask `provider` for the current monitors and validate the layout.
    pub fn enumerate(provider: &dyn MonitorProvider) -> SpanrecResult<Self> {
        let monitors = provider.detect_monitors()?;
        Self::from_monitors(monitors)
    }

    pub fn from_monitors(mut monitors: Vec<MonitorDescriptor>) -> SpanrecResult<Self> {
        if monitors.is_empty() {
            return Err(SpanrecError::NoDisplayFound);
        }

        for (i, a) in monitors.iter().enumerate() {
            for b in &monitors[i + 1..] {
                if a.rect.intersects(&b.rect) {
                    return Err(SpanrecError::platform(format!(
                        "Monitors {} ({}) and {} ({}) overlap",
                        a.id, a.rect, b.id, b.rect
                    )));
                }
            }
        }

        monitors.sort_by_key(|m| (!m.is_primary, m.rect.y(), m.rect.x()));

        let bounds = virtual_desktop_bounds(&monitors)?;

        tracing::debug!(
            monitors = monitors.len(),
            bounds = %bounds,
            "Display topology enumerated"
        );

        Ok(Self { monitors, bounds })
    }

    /// Re-collect after a topology-change notification. Returns whether
    /// the layout actually changed. On error the previous layout is kept.
    pub fn refresh(&mut self, provider: &dyn MonitorProvider) -> SpanrecResult<bool> {
        let fresh = Self::enumerate(provider)?;
        let changed = fresh != *self;
        if changed {
            tracing::info!(
                old_bounds = %self.bounds,
                new_bounds = %fresh.bounds,
                monitors = fresh.monitors.len(),
                "Display topology changed"
            );
            *self = fresh;
        }
        Ok(changed)
    }

    /// Monitors ordered primary first, then top-to-bottom, left-to-right.
    pub fn monitors(&self) -> &[MonitorDescriptor] {
        &self.monitors
    }

    pub fn bounds(&self) -> VirtualDesktopRect {
        self.bounds
    }

    /// The primary monitor, or the first one when none is flagged.
    pub fn primary(&self) -> &MonitorDescriptor {
        // `from_monitors` rejects empty lists and sorts primary first.
        &self.monitors[0]
    }

    pub fn monitor(&self, id: &str) -> Option<&MonitorDescriptor> {
        self.monitors.iter().find(|m| m.id == id)
    }

    /// Monitors overlapping `rect`, each paired with the overlapping part.
    pub fn monitors_intersecting<'a>(
        &'a self,
        rect: &'a VirtualDesktopRect,
    ) -> impl Iterator<Item = (&'a MonitorDescriptor, VirtualDesktopRect)> + 'a {
        self.monitors
            .iter()
            .filter_map(move |m| m.rect.intersection(rect).map(|part| (m, part)))
    }

    /// Pixels of `rect` backed by some monitor.
    pub fn visible_area(&self, rect: &VirtualDesktopRect) -> u64 {
        self.monitors_intersecting(rect)
            .map(|(_, part)| part.area())
            .sum()
    }

    /// Reject a capture rect that no monitor can supply pixels for.
    pub fn validate_capture_rect(&self, rect: &VirtualDesktopRect) -> SpanrecResult<()> {
        if self.visible_area(rect) == 0 {
            return Err(SpanrecError::capture_source(format!(
                "Region {rect} lies entirely outside every monitor (desktop bounds {})",
                self.bounds
            )));
        }
        Ok(())
    }

    /// Human-readable list for error messages.
    pub fn describe(&self) -> String {
        self.monitors
            .iter()
            .map(|m| {
                format!(
                    "{}{}={}",
                    m.id,
                    if m.is_primary { "*" } else { "" },
                    m.rect
                )
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}
