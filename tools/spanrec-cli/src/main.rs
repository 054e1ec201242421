//! Spanrec CLI: record any region of a multi-monitor desktop with system audio.
//!
//! Usage:
//!   spanrec record [OPTIONS]    Record a region, monitor, or window
//!   spanrec monitors            List monitors in virtual desktop coordinates
//!   spanrec mux <VIDEO>         Mux interim artifacts left by a failed session
//!   spanrec check               Check system capabilities

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "spanrec",
    about = "Multi-monitor region screen recorder with loopback audio",
    version,
    author
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record until `stop` is typed or Ctrl+C is pressed
    Record {
        /// Region in virtual desktop coordinates: X,Y,W,H (X and Y may be negative)
        #[arg(long, allow_hyphen_values = true, conflicts_with_all = ["window", "monitor"])]
        region: Option<String>,

        /// Follow an X11 window by id (e.g. 0x3a00007)
        #[arg(long, conflicts_with = "monitor")]
        window: Option<String>,

        /// Record a whole monitor, by name or zero-based index (default: primary)
        #[arg(long)]
        monitor: Option<String>,

        /// Base name for the output files (default: recording_<timestamp>)
        #[arg(short, long)]
        name: Option<String>,

        /// Output directory (default: from config)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Target FPS (default: from config)
        #[arg(long)]
        fps: Option<u32>,

        /// Record video only
        #[arg(long)]
        no_audio: bool,

        /// Keep the interim video and WAV files after muxing
        #[arg(long)]
        keep_interim: bool,

        /// Stop automatically after this many seconds
        #[arg(long)]
        duration: Option<f64>,
    },

    /// List monitors and the virtual desktop bounds
    Monitors {
        /// Print the topology as JSON
        #[arg(long)]
        json: bool,
    },

    /// Mux an interim video with its WAV, fitting audio to the video length
    Mux {
        /// Interim video file
        video: PathBuf,

        /// Interim audio (default: <video stem>_audio.wav next to the video)
        #[arg(long)]
        audio: Option<PathBuf>,

        /// Where the audio starts relative to the first video frame, in
        /// seconds (printed by `record` when a session fails)
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        audio_offset: f64,

        /// Frame rate the video was recorded at
        #[arg(long, default_value = "30")]
        fps: u32,

        /// Video frame count (default: counted with ffprobe)
        #[arg(long)]
        frames: Option<u64>,

        /// Output file (default: <video stem>_final.<ext>)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check system capabilities
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let app_config = spanrec_common::config::AppConfig::load();
    let mut logging = app_config.logging.clone();
    if cli.verbose {
        logging.level = "debug".to_string();
    }
    spanrec_common::logging::init_logging(&logging);

    match cli.command {
        Commands::Record {
            region,
            window,
            monitor,
            name,
            output,
            fps,
            no_audio,
            keep_interim,
            duration,
        } => {
            commands::record::run(
                app_config,
                commands::record::RecordOptions {
                    region,
                    window,
                    monitor,
                    name,
                    output,
                    fps,
                    audio: !no_audio,
                    keep_interim,
                    duration,
                },
            )
            .await
        }
        Commands::Monitors { json } => commands::monitors::run(json),
        Commands::Mux {
            video,
            audio,
            audio_offset,
            fps,
            frames,
            output,
        } => commands::mux::run(video, audio, audio_offset, fps, frames, output),
        Commands::Check => commands::check::run(),
    }
}
