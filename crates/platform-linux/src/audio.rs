//! Loopback (output-monitor) source discovery via `pactl`.
//!
//! Works against both PulseAudio and PipeWire's pulse shim. Only monitor
//! sources qualify: they carry what is being played out. Microphones and
//! line inputs are never chosen.

use serde::Serialize;
use spanrec_common::error::{SpanrecError, SpanrecResult};

use crate::process::{command_exists, run_for_stdout};

/// A loopback source that can be handed to `ffmpeg -f pulse -i <name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoopbackDevice {
    pub name: String,
    /// Whether this is the monitor of the default sink.
    pub is_default_sink_monitor: bool,
}

/// Find the system-output monitor source.
pub fn find_loopback_source() -> SpanrecResult<LoopbackDevice> {
    if !command_exists("pactl") {
        return Err(SpanrecError::no_loopback(
            "pactl not found; PulseAudio or pipewire-pulse is required for system audio",
        ));
    }

    let sources = run_for_stdout("pactl", &["list", "short", "sources"])
        .map_err(|e| SpanrecError::no_loopback(format!("Could not list audio sources: {e}")))?;
    let default_sink = run_for_stdout("pactl", &["get-default-sink"])
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let names = parse_source_names(&sources);
    let device = choose_loopback_source(default_sink.as_deref(), &names).ok_or_else(|| {
        SpanrecError::no_loopback(format!(
            "No monitor source among {} audio source(s)",
            names.len()
        ))
    })?;

    tracing::info!(
        source = %device.name,
        default_sink_monitor = device.is_default_sink_monitor,
        "Selected loopback audio source"
    );
    Ok(device)
}

/// Source names from `pactl list short sources` (tab-separated, name in column 2).
pub fn parse_source_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split('\t').nth(1))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Prefer the default sink's monitor, then any other monitor source.
pub fn choose_loopback_source(
    default_sink: Option<&str>,
    sources: &[String],
) -> Option<LoopbackDevice> {
    if let Some(sink) = default_sink {
        let wanted = format!("{sink}.monitor");
        if sources.iter().any(|s| *s == wanted) {
            return Some(LoopbackDevice {
                name: wanted,
                is_default_sink_monitor: true,
            });
        }
    }

    sources
        .iter()
        .find(|s| is_monitor_source(s))
        .map(|s| LoopbackDevice {
            name: s.clone(),
            is_default_sink_monitor: false,
        })
}

fn is_monitor_source(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".monitor") && !["mic", "line-in", "input"].iter().any(|k| lower.contains(k))
}
