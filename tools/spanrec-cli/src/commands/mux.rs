//! Mux interim artifacts by hand, e.g. after a session failed while muxing.

use std::path::{Path, PathBuf};

use anyhow::Context;
use spanrec_capture_engine::mux::{final_output_path, FfmpegMuxer, MuxRequest, Muxer};
use spanrec_capture_engine::sink::{read_wav_artifact, AudioArtifact};
use spanrec_platform_linux::process::run_for_stdout;

pub fn run(
    video: PathBuf,
    audio: Option<PathBuf>,
    audio_offset: f64,
    fps: u32,
    frames: Option<u64>,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    anyhow::ensure!(video.exists(), "Video not found: {}", video.display());
    anyhow::ensure!(fps > 0, "--fps must be positive");

    let video_frames = match frames {
        Some(frames) => frames,
        None => count_frames(&video)?,
    };

    let audio_path = audio.or_else(|| {
        let sibling = sibling_audio_path(&video);
        sibling.exists().then_some(sibling)
    });
    let audio = match &audio_path {
        Some(path) => read_wav_artifact(path)?.with_start_offset(audio_offset),
        None => AudioArtifact::Absent,
    };

    let request = MuxRequest {
        output_path: output.unwrap_or_else(|| final_output_path(&video)),
        video_path: video,
        video_frames,
        fps,
        audio,
    };
    println!("Muxing {} ({video_frames} frames @ {fps} fps)", request.video_path.display());
    match &audio_path {
        Some(path) => println!("  Audio: {} (starts at {audio_offset:+.3}s)", path.display()),
        None => println!("  Audio: none"),
    }

    let report = FfmpegMuxer.combine(&request)?;
    println!("Saved {} ({:.2}s)", report.output_path.display(), report.duration_secs);
    println!("  Audio fit: {}", serde_json::to_string(&report.audio)?);
    Ok(())
}

/// `<stem>.<ext>` → `<stem>_audio.wav`, the name sessions give the WAV.
fn sibling_audio_path(video: &Path) -> PathBuf {
    let stem = video
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    video.with_file_name(format!("{stem}_audio.wav"))
}

fn count_frames(video: &Path) -> anyhow::Result<u64> {
    let path = video
        .to_str()
        .with_context(|| format!("Non-UTF-8 path: {}", video.display()))?;
    let stdout = run_for_stdout(
        "ffprobe",
        &[
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-count_packets",
            "-show_entries",
            "stream=nb_read_packets",
            "-of",
            "csv=p=0",
            path,
        ],
    )
    .context("Could not count video frames; pass --frames")?;
    let frames = stdout.trim().trim_end_matches(',');
    frames
        .parse()
        .with_context(|| format!("ffprobe reported {frames:?} frames; pass --frames"))
}
