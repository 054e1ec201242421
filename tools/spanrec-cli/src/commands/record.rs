//! Run a recording session from the terminal.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use spanrec_capture_engine::{
    get_backend, CaptureBackend, CaptureTarget, RecordingOutcome, RecordingSession,
    SessionConfig, SessionEvent, SessionHandle, SessionState,
};
use spanrec_common::config::AppConfig;
use spanrec_platform_core::{DisplayTopology, VirtualDesktopRect};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

pub struct RecordOptions {
    pub region: Option<String>,
    pub window: Option<String>,
    pub monitor: Option<String>,
    pub name: Option<String>,
    pub output: Option<PathBuf>,
    pub fps: Option<u32>,
    pub audio: bool,
    pub keep_interim: bool,
    pub duration: Option<f64>,
}

/// A line typed while recording.
#[derive(Debug, PartialEq)]
enum Input {
    Region(VirtualDesktopRect),
    Refresh,
    Stop,
    Help,
}

fn parse_input(line: &str) -> anyhow::Result<Option<Input>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let input = match word {
        "region" | "r" => Input::Region(rest.trim().parse()?),
        "refresh" | "monitors" => Input::Refresh,
        "stop" | "quit" | "q" => Input::Stop,
        "help" | "?" => Input::Help,
        other => anyhow::bail!("Unknown command {other:?} (try `help`)"),
    };
    Ok(Some(input))
}

fn print_help() {
    println!("  region X,Y,W,H   move the capture area (output size is kept)");
    println!("  refresh          re-read the monitor layout");
    println!("  stop             finish and mux the recording");
}

pub async fn run(app_config: AppConfig, options: RecordOptions) -> anyhow::Result<()> {
    let mut config = SessionConfig::from_app_config(&app_config);
    config.base_name = options.name;
    if let Some(output) = options.output {
        config.output_dir = output;
    }
    if let Some(fps) = options.fps {
        anyhow::ensure!(fps > 0, "--fps must be positive");
        config.fps = fps;
    }
    config.capture_audio = config.capture_audio && options.audio;
    config.keep_interim_artifacts = config.keep_interim_artifacts || options.keep_interim;

    let backend = get_backend()?;
    let target = resolve_target(
        backend.as_ref(),
        options.region,
        options.window,
        options.monitor,
    )?;

    println!("Starting recording");
    match &target {
        CaptureTarget::Region(rect) => println!("  Region: {rect}"),
        CaptureTarget::Window { window_id } => println!("  Window: {window_id}"),
    }
    println!("  Output: {}", config.output_dir.display());
    println!("  FPS: {}", config.fps);
    println!("  Audio: {}", config.capture_audio);
    println!();
    tracing::info!(
        fps = config.fps,
        audio = config.capture_audio,
        output_dir = %config.output_dir.display(),
        "Starting recording session"
    );

    let session = RecordingSession::new(config, backend);
    let (handle, task) = SessionHandle::spawn(session);
    let mut events = handle.subscribe();

    handle.start(target).await.context("Failed to start recording")?;

    println!("Recording. Type `stop` or press Ctrl+C to finish, `help` for commands.");
    let outcome = drive(&handle, &mut events, options.duration).await?;

    drop(handle);
    task.await.context("Session task panicked")?;

    print_outcome(&outcome);
    if outcome.state != SessionState::Completed {
        anyhow::bail!(
            "Recording failed: {}",
            outcome.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn drive(
    handle: &SessionHandle,
    events: &mut broadcast::Receiver<SessionEvent>,
    duration: Option<f64>,
) -> anyhow::Result<RecordingOutcome> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let deadline = async {
        match duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs_f64(secs.max(0.0))).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Ok(SessionEvent::Finished { outcome }) => return Ok(outcome),
                Ok(SessionEvent::AudioUnavailable { reason }) => {
                    println!("No system audio ({reason}); recording video only.");
                }
                Ok(SessionEvent::RegionChanged { rect }) => println!("Now capturing {rect}"),
                Ok(SessionEvent::TopologyChanged { bounds, monitors }) => {
                    println!("{monitors} monitor(s), desktop {bounds}");
                }
                Ok(SessionEvent::Error { message }) => eprintln!("Error: {message}"),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            line = lines.next_line(), if stdin_open => {
                let Some(line) = line? else {
                    stdin_open = false;
                    continue;
                };
                match parse_input(&line) {
                    Ok(Some(Input::Stop)) => break,
                    Ok(Some(Input::Region(rect))) => {
                        if let Err(e) = handle.change_region(rect).await {
                            eprintln!("Region not changed: {e}");
                        }
                    }
                    Ok(Some(Input::Refresh)) => {
                        if let Err(e) = handle.topology_changed().await {
                            eprintln!("Monitor refresh failed: {e}");
                        }
                    }
                    Ok(Some(Input::Help)) => print_help(),
                    Ok(None) => {}
                    Err(e) => eprintln!("{e}"),
                }
            }
        }
    }

    println!("Stopping...");
    Ok(handle.stop().await?)
}

fn resolve_target(
    backend: &dyn CaptureBackend,
    region: Option<String>,
    window: Option<String>,
    monitor: Option<String>,
) -> anyhow::Result<CaptureTarget> {
    if let Some(region) = region {
        let rect: VirtualDesktopRect = region.parse()?;
        return Ok(CaptureTarget::Region(rect));
    }
    if let Some(window_id) = window {
        return Ok(CaptureTarget::Window { window_id });
    }

    let topology = DisplayTopology::from_monitors(backend.detect_monitors()?)?;
    let chosen = match monitor {
        None => topology.primary(),
        Some(key) => topology
            .monitor(&key)
            .or_else(|| {
                key.parse::<usize>()
                    .ok()
                    .and_then(|index| topology.monitors().get(index))
            })
            .with_context(|| {
                format!("No monitor {key:?}; available: {}", topology.describe())
            })?,
    };
    Ok(CaptureTarget::Region(chosen.rect))
}

fn print_outcome(outcome: &RecordingOutcome) {
    println!();
    match (&outcome.state, &outcome.final_path) {
        (SessionState::Completed, Some(path)) => {
            println!("Recording saved to: {}", path.display());
        }
        _ => println!("Recording did not complete."),
    }
    if let Some(geometry) = outcome.geometry {
        println!("  Size: {geometry}");
    }
    println!("  Duration: {:.2}s", outcome.duration_secs);
    println!(
        "  Frames: {} for {} ticks ({} repeated, {} dropped)",
        outcome.frames_written, outcome.ticks, outcome.duplicate_frames, outcome.dropped_frames
    );
    println!("  Audio: {}", if outcome.audio_present { "yes" } else { "no" });
    if let Some(offset) = outcome.audio_offset_secs {
        println!("  Audio offset: {offset:+.3}s");
    }
    if let Some(video) = &outcome.video_path {
        println!("  Interim video: {}", video.display());
    }
    if let Some(audio) = &outcome.audio_path {
        println!("  Interim audio: {}", audio.display());
    }
}
