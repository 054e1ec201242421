//! Helpers for the small command-line tools the Linux backend queries.

use std::process::Command;

use spanrec_common::error::{SpanrecError, SpanrecResult};

/// Whether `binary` resolves on `$PATH`.
pub fn command_exists(binary: &str) -> bool {
    Command::new("sh")
        .arg("-c")
        .arg(format!("command -v {binary} >/dev/null 2>&1"))
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Run `program args...` and return its stdout, failing on a non-zero exit.
pub fn run_for_stdout(program: &str, args: &[&str]) -> SpanrecResult<String> {
    let output = Command::new(program).args(args).output().map_err(|e| {
        SpanrecError::platform(format!("Failed to run {program}: {e}"))
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SpanrecError::platform(format!(
            "{program} {} exited with {}: {}",
            args.join(" "),
            output.status,
            stderr.trim()
        )));
    }

    String::from_utf8(output.stdout)
        .map_err(|e| SpanrecError::platform(format!("{program} printed non-UTF-8 output: {e}")))
}
