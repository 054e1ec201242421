//! Window bounds via `xwininfo`.

use spanrec_common::error::{SpanrecError, SpanrecResult};
use spanrec_platform_core::VirtualDesktopRect;

use crate::process::run_for_stdout;

/// Current outer bounds of an X11 window (`0x...` or decimal id).
pub fn query_window_rect(window_id: &str) -> SpanrecResult<VirtualDesktopRect> {
    let output = run_for_stdout("xwininfo", &["-id", window_id])?;
    parse_xwininfo(&output)
}

/// Extract the absolute position and size from `xwininfo -id` output.
pub fn parse_xwininfo(output: &str) -> SpanrecResult<VirtualDesktopRect> {
    let mut x = None;
    let mut y = None;
    let mut width = None;
    let mut height = None;

    for line in output.lines().map(str::trim) {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key {
            "Absolute upper-left X" => x = value.parse::<i32>().ok(),
            "Absolute upper-left Y" => y = value.parse::<i32>().ok(),
            "Width" => width = value.parse::<u32>().ok(),
            "Height" => height = value.parse::<u32>().ok(),
            _ => {}
        }
    }

    match (x, y, width, height) {
        (Some(x), Some(y), Some(w), Some(h)) => VirtualDesktopRect::new(x, y, w, h),
        _ => Err(SpanrecError::platform(
            "xwininfo output is missing window geometry",
        )),
    }
}
