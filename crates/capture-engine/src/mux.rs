//! Combine the interim video and audio into the final file.
//!
//! Video frame 0 is the recording's common zero. Audio is first moved to
//! where its first sample was captured on that timeline (delayed when it
//! started late, trimmed when it started early), then padded with silence
//! or truncated at the tail. The video frame count is authoritative and
//! video is never cut.

use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::Serialize;
use spanrec_common::error::{SpanrecError, SpanrecResult};

use crate::sink::AudioArtifact;

/// Everything needed to produce the final output.
#[derive(Debug, Clone, PartialEq)]
pub struct MuxRequest {
    pub video_path: PathBuf,
    pub video_frames: u64,
    pub fps: u32,
    pub audio: AudioArtifact,
    pub output_path: PathBuf,
}

/// How the audio tail is fitted to the video's duration, after the audio
/// was placed at its start offset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AudioAdjustment {
    /// No audio; the output is video-only.
    Absent,
    Exact,
    Pad { secs: f64 },
    Truncate { secs: f64 },
}

/// Audio/video durations closer than this are treated as equal.
const DURATION_EPSILON_SECS: f64 = 0.000_5;

/// A fully resolved mux, independent of how it is executed.
#[derive(Debug, Clone, PartialEq)]
pub struct MuxPlan {
    pub video_duration_secs: f64,
    /// Where the audio starts on the video timeline. Positive values are
    /// leading silence, negative values are trimmed from the audio head.
    pub audio_offset_secs: f64,
    pub audio: AudioAdjustment,
    pub ffmpeg_args: Vec<String>,
}

impl MuxPlan {
    pub fn new(request: &MuxRequest) -> SpanrecResult<Self> {
        if request.video_frames == 0 {
            return Err(SpanrecError::mux("Interim video has no frames"));
        }
        let fps = request.fps.max(1);
        let video_duration_secs = request.video_frames as f64 / fps as f64;
        let duration = format_secs(video_duration_secs);

        let mut args: Vec<String> = vec![
            "-y".into(),
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-i".into(),
            path_arg(&request.video_path),
        ];

        let placed = match (&request.audio, request.audio.end_secs()) {
            (AudioArtifact::Written { path, .. }, Some(end_secs)) if end_secs > DURATION_EPSILON_SECS => {
                Some((path, request.audio.start_offset_secs(), end_secs))
            }
            (AudioArtifact::Written { path, .. }, _) => {
                tracing::warn!(
                    path = %path.display(),
                    start_offset_secs = request.audio.start_offset_secs(),
                    "Audio ends before the recording started; muxing video only"
                );
                None
            }
            (AudioArtifact::Absent, _) => None,
        };

        let (audio, audio_offset_secs) = match placed {
            Some((path, offset, end_secs)) => {
                args.extend([
                    "-i".into(),
                    path_arg(path),
                    "-map".into(),
                    "0:v:0".into(),
                    "-map".into(),
                    "1:a:0".into(),
                    "-c:v".into(),
                    "copy".into(),
                    "-c:a".into(),
                    "aac".into(),
                    "-b:a".into(),
                    "192k".into(),
                    "-af".into(),
                    audio_filter(offset, &duration),
                ]);
                let delta = video_duration_secs - end_secs;
                let adjustment = if delta > DURATION_EPSILON_SECS {
                    AudioAdjustment::Pad { secs: delta }
                } else if delta < -DURATION_EPSILON_SECS {
                    AudioAdjustment::Truncate { secs: -delta }
                } else {
                    AudioAdjustment::Exact
                };
                (adjustment, offset)
            }
            None => {
                args.extend([
                    "-map".into(),
                    "0:v:0".into(),
                    "-c:v".into(),
                    "copy".into(),
                    "-an".into(),
                ]);
                (AudioAdjustment::Absent, 0.0)
            }
        };

        args.extend(["-t".into(), duration, path_arg(&request.output_path)]);

        Ok(Self {
            video_duration_secs,
            audio_offset_secs,
            audio,
            ffmpeg_args: args,
        })
    }
}

/// What a finished mux produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MuxReport {
    pub output_path: PathBuf,
    pub duration_secs: f64,
    pub audio: AudioAdjustment,
}

/// Executes a [`MuxRequest`].
pub trait Muxer: Send + Sync {
    fn combine(&self, request: &MuxRequest) -> SpanrecResult<MuxReport>;
}

/// Muxes with the `ffmpeg` executable.
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegMuxer;

impl Muxer for FfmpegMuxer {
    fn combine(&self, request: &MuxRequest) -> SpanrecResult<MuxReport> {
        let plan = MuxPlan::new(request)?;
        if !request.video_path.exists() {
            return Err(SpanrecError::FileNotFound {
                path: request.video_path.clone(),
            });
        }

        tracing::debug!(args = ?plan.ffmpeg_args, "Running ffmpeg mux");
        let mut child = Command::new("ffmpeg")
            .args(&plan.ffmpeg_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SpanrecError::mux(format!("Failed to start ffmpeg: {e}")))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SpanrecError::mux("Failed to capture ffmpeg stderr"))?;

        // Drain stderr concurrently to avoid ffmpeg blocking on a full pipe.
        let stderr_task = std::thread::spawn(move || -> String {
            let mut reader = BufReader::new(stderr);
            let mut output = String::new();
            match reader.read_to_string(&mut output) {
                Ok(_) => output,
                Err(err) => format!("<failed to read ffmpeg stderr: {err}>"),
            }
        });

        let status = child
            .wait()
            .map_err(|e| SpanrecError::mux(format!("Failed to wait on ffmpeg: {e}")))?;
        let stderr_output = stderr_task
            .join()
            .unwrap_or_else(|_| "<failed to join stderr reader>".to_string());

        if !status.success() {
            return Err(SpanrecError::mux(format!(
                "ffmpeg mux failed (status {}): {}",
                status,
                stderr_output.trim()
            )));
        }
        if !request.output_path.exists() {
            return Err(SpanrecError::mux(format!(
                "ffmpeg reported success but {} is missing",
                request.output_path.display()
            )));
        }

        tracing::info!(
            output = %request.output_path.display(),
            duration_secs = plan.video_duration_secs,
            audio = ?plan.audio,
            "Mux complete"
        );

        Ok(MuxReport {
            output_path: request.output_path.clone(),
            duration_secs: plan.video_duration_secs,
            audio: plan.audio,
        })
    }
}

/// `<stem>_final.<ext>` next to the interim video.
pub fn final_output_path(video_path: &Path) -> PathBuf {
    let stem = video_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "recording".to_string());
    let name = match video_path.extension() {
        Some(ext) => format!("{stem}_final.{}", ext.to_string_lossy()),
        None => format!("{stem}_final"),
    };
    video_path.with_file_name(name)
}

/// Filter chain placing audio at `offset_secs` and padding it to
/// `whole_dur`; `-t` cuts whatever runs past the video.
fn audio_filter(offset_secs: f64, whole_dur: &str) -> String {
    let mut filters = Vec::with_capacity(3);
    if offset_secs > DURATION_EPSILON_SECS {
        let delay_ms = (offset_secs * 1000.0).round() as u64;
        filters.push(format!("adelay=delays={delay_ms}:all=1"));
    } else if offset_secs < -DURATION_EPSILON_SECS {
        filters.push(format!("atrim=start={}", format_secs(-offset_secs)));
        filters.push("asetpts=PTS-STARTPTS".to_string());
    }
    filters.push(format!("apad=whole_dur={whole_dur}"));
    filters.join(",")
}

fn format_secs(secs: f64) -> String {
    format!("{secs:.6}")
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
