//! Spanrec platform core contracts.
//!
//! Virtual-desktop geometry and monitor topology shared by the platform
//! backends and the capture engine, free of any concrete OS dependency.

pub mod geometry;
pub mod topology;

use serde::{Deserialize, Serialize};

pub use geometry::VirtualDesktopRect;
pub use topology::{virtual_desktop_bounds, DisplayTopology, MonitorDescriptor, MonitorProvider};

/// Display server family used for capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DisplayServer {
    Wayland,
    X11,
    #[default]
    Unknown,
}

impl DisplayServer {
    /// Detect from the session environment. Wayland wins when both are set,
    /// since `DISPLAY` is then usually XWayland.
    pub fn detect() -> Self {
        if std::env::var_os("WAYLAND_DISPLAY").is_some() {
            Self::Wayland
        } else if std::env::var_os("DISPLAY").is_some() {
            Self::X11
        } else {
            Self::Unknown
        }
    }
}

impl std::fmt::Display for DisplayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Wayland => write!(f, "wayland"),
            Self::X11 => write!(f, "x11"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}
