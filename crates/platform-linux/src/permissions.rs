//! Capability detection and guidance for Linux.
//!
//! Spanrec shells out to a handful of desktop tools and needs an X11
//! display it can grab from.

use spanrec_platform_core::DisplayServer;

use crate::audio::find_loopback_source;
use crate::process::command_exists;

/// A system capability that spanrec may need.
#[derive(Debug, Clone)]
pub struct Capability {
    pub name: String,
    pub description: String,
    pub available: bool,
    pub required: bool,
    pub fix_instructions: Option<String>,
}

impl Capability {
    fn tool(binary: &str, description: &str, required: bool, fix: &str) -> Self {
        let available = command_exists(binary);
        Self {
            name: binary.to_string(),
            description: description.to_string(),
            available,
            required,
            fix_instructions: (!available).then(|| fix.to_string()),
        }
    }
}

/// Check all capabilities and report status.
pub fn check_capabilities() -> Vec<Capability> {
    vec![
        check_display_access(),
        Capability::tool(
            "ffmpeg",
            "Screen grabbing, encoding and muxing",
            true,
            "Install ffmpeg: sudo apt install ffmpeg",
        ),
        Capability::tool(
            "xrandr",
            "Monitor layout discovery",
            true,
            "Install xrandr: sudo apt install x11-xserver-utils",
        ),
        Capability::tool(
            "pactl",
            "Loopback audio source discovery",
            false,
            "Install pactl: sudo apt install pulseaudio-utils",
        ),
        Capability::tool(
            "xwininfo",
            "Window-follow capture mode",
            false,
            "Install xwininfo: sudo apt install x11-utils",
        ),
        check_loopback_device(),
    ]
}

/// Whether all required capabilities are present.
pub fn all_required_available(capabilities: &[Capability]) -> bool {
    capabilities.iter().all(|c| c.available || !c.required)
}

/// The x11grab path needs `DISPLAY`; under Wayland that means XWayland,
/// which only exposes X11 clients.
fn check_display_access() -> Capability {
    let server = DisplayServer::detect();
    let has_x = std::env::var_os("DISPLAY").is_some();

    let fix_instructions = match (server, has_x) {
        (_, false) => Some("Run spanrec inside a graphical X11 session (DISPLAY must be set)".to_string()),
        (DisplayServer::Wayland, true) => Some(
            "Wayland detected: only XWayland windows are visible to x11grab; log into an X11 session for full-desktop capture"
                .to_string(),
        ),
        _ => None,
    };

    Capability {
        name: "X11 Display".to_string(),
        description: format!("Desktop to capture (session type: {server})"),
        available: has_x,
        required: true,
        fix_instructions,
    }
}

fn check_loopback_device() -> Capability {
    let result = find_loopback_source();
    let description = match &result {
        Ok(device) => format!("System audio output monitor ({})", device.name),
        Err(_) => "System audio output monitor".to_string(),
    };

    Capability {
        name: "Loopback Audio".to_string(),
        description,
        available: result.is_ok(),
        // Recording falls back to video-only.
        required: false,
        fix_instructions: result.err().map(|e| {
            format!("{e}. Ensure PulseAudio or pipewire-pulse is running with an output sink")
        }),
    }
}

/// Print a user-friendly capability report.
pub fn print_capability_report(capabilities: &[Capability]) {
    println!("Spanrec System Capabilities:");
    println!("{}", "-".repeat(60));

    for cap in capabilities {
        let status = if cap.available {
            "[OK]"
        } else if cap.required {
            "[MISSING - REQUIRED]"
        } else {
            "[MISSING - OPTIONAL]"
        };

        println!("  {} {}: {}", status, cap.name, cap.description);

        if let Some(ref fix) = cap.fix_instructions {
            println!("    Fix: {fix}");
        }
    }
}
