//! Spanrec Linux Platform Integration
//!
//! Platform-specific discovery for Linux desktops:
//! - **Display Detection:** Monitor layout from `xrandr`
//! - **Loopback Audio:** PulseAudio/PipeWire monitor sources from `pactl`
//! - **Windows:** Live window bounds from `xwininfo`
//! - **Permissions:** Capability detection and user guidance

pub mod audio;
pub mod display;
pub mod permissions;
pub mod process;
pub mod window;

pub use audio::{find_loopback_source, LoopbackDevice};
pub use display::{detect_display_server, XrandrMonitorProvider};
pub use spanrec_platform_core::DisplayServer;
pub use window::query_window_rect;
