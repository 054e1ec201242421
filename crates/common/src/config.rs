//! Application configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Global application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory where recordings (interim and final) are written.
    pub recordings_dir: PathBuf,

    /// Default recording settings.
    pub recording: RecordingDefaults,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Default recording parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingDefaults {
    /// Tick clock cadence.
    pub fps: u32,

    /// Container extension for interim and final video.
    pub container: String,

    /// ffmpeg video encoder name.
    pub video_codec: String,

    /// Requested loopback sample rate.
    pub audio_sample_rate: u32,

    /// Requested loopback channel count.
    pub audio_channels: u16,

    /// Whether to capture system audio at all.
    pub capture_audio: bool,

    /// Frames buffered between capture and encoder before the oldest is dropped.
    pub frame_queue_capacity: usize,

    /// Consecutive failed grabs tolerated before capture is declared dead.
    pub capture_retry_ticks: u32,

    /// RGBA used for pixels outside every monitor.
    pub fill_color: [u8; 4],

    /// Keep interim video/audio after a successful mux.
    pub keep_interim_artifacts: bool,

    /// How long stop waits for a blocked audio reader before detaching it.
    pub audio_stop_grace_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "spanrec=debug,warn").
    pub level: String,

    /// Whether to output structured JSON logs.
    pub json: bool,

    /// Optional log file path.
    pub file: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            recordings_dir: default_recordings_dir(),
            recording: RecordingDefaults::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for RecordingDefaults {
    fn default() -> Self {
        Self {
            fps: 30,
            container: "mp4".to_string(),
            video_codec: "libx264".to_string(),
            audio_sample_rate: 48000,
            audio_channels: 2,
            capture_audio: true,
            frame_queue_capacity: 8,
            capture_retry_ticks: 30,
            fill_color: [0, 0, 0, 255],
            keep_interim_artifacts: false,
            audio_stop_grace_ms: 2000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

impl AppConfig {
    /// Load config from the standard location, falling back to defaults.
    pub fn load() -> Self {
        let config_path = config_file_path();
        if config_path.exists() {
            match std::fs::read_to_string(&config_path) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Failed to parse config at {:?}: {}", config_path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read config at {:?}: {}", config_path, e);
                }
            }
        }
        Self::default()
    }

    /// Save config to the standard location.
    pub fn save(&self) -> Result<(), std::io::Error> {
        let config_path = config_file_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(config_path, json)
    }
}

/// Standard config file location.
pub fn config_file_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        });
    base.join("spanrec").join("config.json")
}

/// Default recordings directory.
fn default_recordings_dir() -> PathBuf {
    let base = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local").join("share")
        });
    base.join("spanrec").join("recordings")
}
