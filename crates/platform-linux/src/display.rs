//! Display/monitor detection via `xrandr`.

use spanrec_common::error::{SpanrecError, SpanrecResult};
use spanrec_platform_core::{DisplayServer, MonitorDescriptor, MonitorProvider, VirtualDesktopRect};

use crate::process::run_for_stdout;

/// Monitor provider backed by `xrandr --listmonitors`.
#[derive(Debug, Clone, Copy, Default)]
pub struct XrandrMonitorProvider;

impl MonitorProvider for XrandrMonitorProvider {
    fn detect_monitors(&self) -> SpanrecResult<Vec<MonitorDescriptor>> {
        tracing::debug!("Detecting monitors with xrandr");
        let output = run_for_stdout("xrandr", &["--listmonitors"])?;
        parse_listmonitors(&output)
    }
}

/// Detect the current display server.
pub fn detect_display_server() -> DisplayServer {
    DisplayServer::detect()
}

/// Parse the output of `xrandr --listmonitors`.
///
/// ```text
/// Monitors: 2
///  0: +*DP-1 2560/597x1440/336+0+0  DP-1
///  1: +HDMI-1 1920/527x1080/296-1920+0  HDMI-1
/// ```
pub fn parse_listmonitors(output: &str) -> SpanrecResult<Vec<MonitorDescriptor>> {
    let mut monitors = Vec::new();
    for line in output.lines().map(str::trim) {
        if line.is_empty() || line.starts_with("Monitors:") {
            continue;
        }
        monitors.push(parse_monitor_line(line)?);
    }
    Ok(monitors)
}

fn parse_monitor_line(line: &str) -> SpanrecResult<MonitorDescriptor> {
    let malformed = || SpanrecError::platform(format!("Unrecognized xrandr monitor line: {line:?}"));

    let (_, rest) = line.split_once(':').ok_or_else(malformed)?;
    let mut fields = rest.split_whitespace();
    let flagged_name = fields.next().ok_or_else(malformed)?;
    let geometry = fields.next().ok_or_else(malformed)?;

    let flags_len = flagged_name
        .find(|c: char| c != '+' && c != '*')
        .ok_or_else(malformed)?;
    let (flags, name) = flagged_name.split_at(flags_len);
    let rect = parse_geometry(geometry).ok_or_else(malformed)?;

    Ok(MonitorDescriptor::new(name, rect, flags.contains('*')))
}

/// `W/mmxH/mm+X+Y`, where the offsets carry their own sign.
fn parse_geometry(geometry: &str) -> Option<VirtualDesktopRect> {
    let (width_part, rest) = geometry.split_once('x')?;
    let width = width_part.split('/').next()?.parse::<u32>().ok()?;

    let offset_start = rest.find(['+', '-'])?;
    let (height_part, offsets) = rest.split_at(offset_start);
    let height = height_part.split('/').next()?.parse::<u32>().ok()?;

    let y_start = offsets[1..].find(['+', '-'])? + 1;
    let (x, y) = offsets.split_at(y_start);
    let x = x.parse::<i32>().ok()?;
    let y = y.parse::<i32>().ok()?;

    VirtualDesktopRect::new(x, y, width, height).ok()
}
