//! Recording session management.
//!
//! A [`RecordingSession`] owns one recording from start to the final muxed
//! file. It is driven either directly or through a [`SessionHandle`], which
//! serializes commands through a FIFO queue so a stop and a region change
//! issued in the same instant are applied in the order they were sent.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use image::Rgba;
use serde::Serialize;
use spanrec_common::clock::{DriftMeasurement, RecordingClock, SystemTimeSource, TickClock, TimeSource};
use spanrec_common::config::AppConfig;
use spanrec_common::error::{SpanrecError, SpanrecResult};
use spanrec_platform_core::{DisplayTopology, VirtualDesktopRect};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::backend::CaptureBackend;
use crate::frame::OutputGeometry;
use crate::mux::{final_output_path, MuxRequest};
use crate::pipeline::{
    spawn_audio_pipeline, spawn_video_pipeline, AudioPipeline, PipelineFault, VideoPipeline,
    AUDIO_QUEUE_CAPACITY,
};
use crate::sink::{AudioArtifact, AudioSink, FrameSink};
use crate::source::{
    CaptureOptions, CaptureSource, RegionCapture, RegionHandle, SharedTopology, WindowCapture,
};

/// Audio and video durations further apart than this are logged.
const DRIFT_WARN_MS: f64 = 100.0;
const EVENT_CHANNEL_CAPACITY: usize = 64;
const COMMAND_QUEUE_DEPTH: usize = 32;

/// What to record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureTarget {
    /// A rectangle in virtual desktop coordinates; may span monitors.
    Region(VirtualDesktopRect),
    /// A window whose bounds are re-read every tick.
    Window { window_id: String },
}

/// Configuration for one recording session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Directory for interim and final artifacts.
    pub output_dir: PathBuf,

    /// Artifact base name; a timestamped one is generated when unset.
    pub base_name: Option<String>,

    pub fps: u32,
    pub container: String,
    pub video_codec: String,

    pub capture_audio: bool,
    pub audio_sample_rate: u32,
    pub audio_channels: u16,

    pub frame_queue_capacity: usize,
    pub capture_retry_ticks: u32,
    pub fill_color: [u8; 4],
    pub keep_interim_artifacts: bool,
    pub audio_stop_grace_ms: u64,
}

impl SessionConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        let recording = &config.recording;
        Self {
            output_dir: config.recordings_dir.clone(),
            base_name: None,
            fps: recording.fps,
            container: recording.container.clone(),
            video_codec: recording.video_codec.clone(),
            capture_audio: recording.capture_audio,
            audio_sample_rate: recording.audio_sample_rate,
            audio_channels: recording.audio_channels,
            frame_queue_capacity: recording.frame_queue_capacity,
            capture_retry_ticks: recording.capture_retry_ticks,
            fill_color: recording.fill_color,
            keep_interim_artifacts: recording.keep_interim_artifacts,
            audio_stop_grace_ms: recording.audio_stop_grace_ms,
        }
    }

    /// Resolve artifact paths, generating a base name from local time when
    /// none was configured.
    pub fn artifact_paths(&self) -> ArtifactPaths {
        let base = self
            .base_name
            .clone()
            .unwrap_or_else(|| timestamped_base_name(chrono::Local::now()));
        ArtifactPaths::new(&self.output_dir, &base, &self.container)
    }

    fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            fill: Rgba(self.fill_color),
            retry_ticks: self.capture_retry_ticks,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_app_config(&AppConfig::default())
    }
}

/// `recording_YYYYMMDD_HHMMSS`.
pub fn timestamped_base_name<Tz: chrono::TimeZone>(now: chrono::DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    now.format("recording_%Y%m%d_%H%M%S").to_string()
}

/// Where a session's files go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactPaths {
    /// Interim video, `<base>.<ext>`.
    pub video: PathBuf,
    /// Interim audio, `<base>_audio.wav`.
    pub audio: PathBuf,
    /// Muxed result, `<base>_final.<ext>`.
    pub final_output: PathBuf,
}

impl ArtifactPaths {
    pub fn new(dir: &Path, base: &str, container: &str) -> Self {
        let video = dir.join(format!("{base}.{container}"));
        Self {
            audio: dir.join(format!("{base}_audio.wav")),
            final_output: final_output_path(&video),
            video,
        }
    }
}

/// State of a recording session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, not started.
    #[default]
    Idle,
    Starting,
    Recording,
    RegionChanging,
    Stopping,
    Finalizing,
    Completed,
    Failed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Starting, Recording)
                | (Recording, RegionChanging)
                | (RegionChanging, Recording)
                | (Recording, Stopping)
                | (Stopping, Finalizing)
                | (Finalizing, Completed)
                | (Idle | Starting | Recording | RegionChanging | Stopping | Finalizing, Failed)
        )
    }

    /// No further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Recording => "recording",
            Self::RegionChanging => "region-changing",
            Self::Stopping => "stopping",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Summary of a finished session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecordingOutcome {
    pub state: SessionState,
    /// Muxed output; `None` unless the session completed.
    pub final_path: Option<PathBuf>,
    /// Interim video, when it was kept.
    pub video_path: Option<PathBuf>,
    /// Interim audio, when it was kept.
    pub audio_path: Option<PathBuf>,
    pub geometry: Option<OutputGeometry>,
    pub frames_written: u64,
    pub duplicate_frames: u64,
    pub dropped_frames: u64,
    pub gap_fills: u64,
    /// The final file carries an audio track.
    pub audio_present: bool,
    /// Ticks the capture source served; equals `frames_written` on success.
    pub ticks: u64,
    /// Where the first audio sample sits relative to video frame 0.
    pub audio_offset_secs: Option<f64>,
    pub duration_secs: f64,
    pub error: Option<String>,
}

impl RecordingOutcome {
    pub fn is_completed(&self) -> bool {
        self.state == SessionState::Completed
    }
}

/// Notifications for whoever drives the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    Started {
        rect: VirtualDesktopRect,
        geometry: OutputGeometry,
        audio: bool,
    },
    AudioUnavailable {
        reason: String,
    },
    RegionChanged {
        rect: VirtualDesktopRect,
    },
    RegionRejected {
        rect: VirtualDesktopRect,
        reason: String,
    },
    TopologyChanged {
        bounds: VirtualDesktopRect,
        monitors: usize,
    },
    Error {
        message: String,
    },
    Finished {
        outcome: RecordingOutcome,
    },
}

struct ActiveRecording {
    paths: ArtifactPaths,
    geometry: OutputGeometry,
    topology: SharedTopology,
    region: Option<RegionHandle>,
    video: VideoPipeline,
    audio: Option<AudioPipeline>,
    clock: RecordingClock,
}

/// Drives one recording through its state machine.
pub struct RecordingSession {
    config: SessionConfig,
    backend: Arc<dyn CaptureBackend>,
    time: Option<Arc<dyn TimeSource>>,
    state: SessionState,
    events: broadcast::Sender<SessionEvent>,
    faults_tx: mpsc::UnboundedSender<PipelineFault>,
    faults_rx: Option<mpsc::UnboundedReceiver<PipelineFault>>,
    active: Option<ActiveRecording>,
    outcome: Option<RecordingOutcome>,
}

impl RecordingSession {
    pub fn new(config: SessionConfig, backend: Arc<dyn CaptureBackend>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        Self {
            config,
            backend,
            time: None,
            state: SessionState::Idle,
            events,
            faults_tx,
            faults_rx: Some(faults_rx),
            active: None,
            outcome: None,
        }
    }

    /// Drive the tick clock from `time` instead of the system clock.
    pub fn with_time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = Some(time);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Faults raised by pipeline workers. Whoever takes this is expected to
    /// call [`RecordingSession::fail`] for each one.
    pub fn take_fault_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<PipelineFault>> {
        self.faults_rx.take()
    }

    /// Outcome of a session that reached a terminal state.
    pub fn outcome(&self) -> Option<&RecordingOutcome> {
        self.outcome.as_ref()
    }

    /// The rect currently being captured.
    pub fn active_rect(&self) -> Option<VirtualDesktopRect> {
        self.active
            .as_ref()
            .and_then(|a| a.region.as_ref())
            .map(RegionHandle::get)
    }

    /// Enumerate monitors, open capture and sinks, and begin recording.
    pub async fn start(&mut self, target: CaptureTarget) -> SpanrecResult<()> {
        if self.state != SessionState::Idle {
            return Err(SpanrecError::invalid_state(format!(
                "Cannot start a session in state {}",
                self.state
            )));
        }

        let backend = self.backend.clone();
        let topology = match tokio::task::spawn_blocking(move || enumerate(backend.as_ref()))
            .await
            .map_err(join_error)
            .and_then(|r| r)
        {
            Ok(topology) => topology,
            Err(e) => {
                tracing::error!(error = %e, "Monitor enumeration failed");
                self.conclude_failed(RecordingOutcome::default(), e.to_string())?;
                return Err(e);
            }
        };
        tracing::info!(
            monitors = topology.monitors().len(),
            bounds = %topology.bounds(),
            backend = self.backend.name(),
            "Starting recording session"
        );

        self.transition(SessionState::Starting)?;

        let paths = self.config.artifact_paths();
        let shared = SharedTopology::new(topology);
        let clock = RecordingClock::start();
        let time: Arc<dyn TimeSource> = match &self.time {
            Some(time) => time.clone(),
            None => Arc::new(SystemTimeSource::from_clock(&clock)),
        };
        let plan = LaunchPlan {
            backend: self.backend.clone(),
            config: self.config.clone(),
            paths: paths.clone(),
            topology: shared.clone(),
            target,
            time,
            faults: self.faults_tx.clone(),
        };

        let launched = match tokio::task::spawn_blocking(move || launch(plan))
            .await
            .map_err(join_error)
            .and_then(|r| r)
        {
            Ok(launched) => launched,
            Err(e) => {
                tracing::error!(error = %e, "Session failed to start");
                self.conclude_failed(RecordingOutcome::default(), e.to_string())?;
                return Err(e);
            }
        };

        if let Some(reason) = &launched.audio_unavailable {
            self.emit(SessionEvent::AudioUnavailable {
                reason: reason.clone(),
            });
        }
        let audio = launched.audio.is_some();
        let rect = launched.initial_rect;
        let geometry = launched.geometry;
        self.active = Some(ActiveRecording {
            paths,
            geometry,
            topology: shared,
            region: launched.region,
            video: launched.video,
            audio: launched.audio,
            clock,
        });
        self.transition(SessionState::Recording)?;

        tracing::info!(rect = %rect, %geometry, audio, "Recording started");
        self.emit(SessionEvent::Started {
            rect,
            geometry,
            audio,
        });
        Ok(())
    }

    /// Swap the capture rect. The output geometry stays fixed; frames of
    /// the new rect are stretched to it.
    pub fn change_region(&mut self, rect: VirtualDesktopRect) -> SpanrecResult<()> {
        if self.state != SessionState::Recording {
            return Err(SpanrecError::invalid_state(format!(
                "Cannot change region in state {}",
                self.state
            )));
        }
        let Some(active) = self.active.as_ref() else {
            return Err(SpanrecError::invalid_state("No active recording"));
        };
        let Some(region) = active.region.clone() else {
            return Err(SpanrecError::unsupported(
                "Region changes are not available while following a window",
            ));
        };

        self.transition(SessionState::RegionChanging)?;
        let result = match region.change(rect) {
            Ok(generation) => {
                tracing::info!(rect = %rect, generation, "Capture region changed");
                self.emit(SessionEvent::RegionChanged { rect });
                Ok(())
            }
            Err(e) => {
                tracing::warn!(rect = %rect, error = %e, "Region change rejected; keeping previous region");
                self.emit(SessionEvent::RegionRejected {
                    rect,
                    reason: e.to_string(),
                });
                Err(e)
            }
        };
        self.transition(SessionState::Recording)?;
        result
    }

    /// Re-enumerate monitors after a hotplug or layout change.
    pub async fn topology_changed(&mut self) -> SpanrecResult<()> {
        if self.state != SessionState::Recording {
            return Err(SpanrecError::invalid_state(format!(
                "Cannot refresh monitors in state {}",
                self.state
            )));
        }
        let backend = self.backend.clone();
        let topology = tokio::task::spawn_blocking(move || enumerate(backend.as_ref()))
            .await
            .map_err(join_error)??;

        let Some(active) = self.active.as_ref() else {
            return Err(SpanrecError::invalid_state("No active recording"));
        };
        if let Some(region) = &active.region {
            let rect = region.get();
            if let Err(e) = topology.validate_capture_rect(&rect) {
                tracing::warn!(rect = %rect, error = %e, "Active region is off-screen after layout change; fill color covers it");
            }
        }
        let bounds = topology.bounds();
        let monitors = topology.monitors().len();
        active.topology.replace(topology);

        tracing::info!(bounds = %bounds, monitors, "Monitor topology updated");
        self.emit(SessionEvent::TopologyChanged { bounds, monitors });
        Ok(())
    }

    /// Stop recording, close both sinks, and mux.
    ///
    /// Returns the outcome whether the session completed or failed; `Err`
    /// only when there is nothing to stop. Stopping a session that already
    /// ended returns its outcome again.
    pub async fn stop(&mut self) -> SpanrecResult<RecordingOutcome> {
        match self.state {
            SessionState::Recording => self.wind_down(None).await,
            state if state.is_terminal() => self.outcome.clone().ok_or_else(|| {
                SpanrecError::invalid_state(format!("Session is {state} without an outcome"))
            }),
            state => Err(SpanrecError::invalid_state(format!(
                "Cannot stop a session in state {state}"
            ))),
        }
    }

    /// React to a worker fault. Tears the session down to `Failed`,
    /// preserving whatever was written. Ignored once the session is no
    /// longer recording.
    pub async fn fail(&mut self, fault: PipelineFault) -> Option<RecordingOutcome> {
        if self.state != SessionState::Recording {
            tracing::debug!(pipeline = fault.pipeline, state = %self.state, "Ignoring late pipeline fault");
            return None;
        }
        let message = format!("{} pipeline failed: {}", fault.pipeline, fault.message);
        tracing::error!(%message, "Aborting recording");
        match self.wind_down(Some(message)).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::error!(error = %e, "Failed to tear down session");
                None
            }
        }
    }

    async fn wind_down(&mut self, cause: Option<String>) -> SpanrecResult<RecordingOutcome> {
        self.transition(SessionState::Stopping)?;
        let Some(active) = self.active.take() else {
            return Err(SpanrecError::invalid_state("No active recording"));
        };
        let ActiveRecording {
            paths,
            geometry,
            video,
            audio,
            clock,
            ..
        } = active;

        let grace = Duration::from_millis(self.config.audio_stop_grace_ms);
        let drained = tokio::task::spawn_blocking(move || {
            let video = video.finish();
            let audio = audio.map(|a| a.finish(grace));
            (video, audio)
        })
        .await;

        let mut outcome = RecordingOutcome {
            geometry: Some(geometry),
            video_path: paths.video.exists().then(|| paths.video.clone()),
            ..RecordingOutcome::default()
        };
        let mut error = cause;

        let (video, audio) = match drained {
            Ok(drained) => drained,
            Err(e) => {
                let message = join_error(e).to_string();
                return self.conclude_failed(outcome, error.unwrap_or(message));
            }
        };

        match video {
            Ok(report) => {
                outcome.frames_written = report.sink.frames_written;
                outcome.ticks = report.capture.ticks;
                outcome.duplicate_frames = report.capture.duplicates();
                outcome.dropped_frames = report.pipeline.frames_dropped;
                outcome.gap_fills = report.pipeline.gap_fills;
                outcome.duration_secs = report.sink.duration_secs();
            }
            Err(e) => {
                error.get_or_insert_with(|| e.to_string());
            }
        }
        let artifact = match audio {
            None => AudioArtifact::Absent,
            Some(Ok(report)) => report.artifact,
            Some(Err(e)) => {
                error.get_or_insert_with(|| e.to_string());
                AudioArtifact::Absent
            }
        };
        outcome.audio_offset_secs = artifact.is_written().then(|| artifact.start_offset_secs());
        outcome.audio_path = match artifact.path() {
            Some(path) => Some(path.to_path_buf()),
            None => paths.audio.exists().then(|| paths.audio.clone()),
        };

        tracing::info!(
            frames = outcome.frames_written,
            duplicates = outcome.duplicate_frames,
            dropped = outcome.dropped_frames,
            wall_secs = clock.elapsed_secs(),
            "Recording stopped"
        );

        if let Some(error) = error {
            return self.conclude_failed(outcome, error);
        }

        if let Some(audio_end_secs) = artifact.end_secs() {
            let drift = DriftMeasurement {
                reference_ns: RecordingClock::secs_to_ns(outcome.duration_secs),
                measured_ns: RecordingClock::secs_to_ns(audio_end_secs.max(0.0)),
            };
            if drift.exceeds_threshold_ms(DRIFT_WARN_MS) {
                tracing::warn!(
                    drift_ms = drift.drift_ms(),
                    video_secs = outcome.duration_secs,
                    audio_end_secs,
                    audio_offset_secs = artifact.start_offset_secs(),
                    "Audio and video end apart; audio will be fitted to video"
                );
            }
        }

        self.transition(SessionState::Finalizing)?;
        let request = MuxRequest {
            video_path: paths.video.clone(),
            video_frames: outcome.frames_written,
            fps: self.config.fps,
            audio: artifact.clone(),
            output_path: paths.final_output.clone(),
        };
        let muxer = self.backend.muxer();
        let muxed = tokio::task::spawn_blocking(move || muxer.combine(&request))
            .await
            .map_err(join_error)
            .and_then(|r| r);

        let report = match muxed {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(error = %e, "Mux failed; interim artifacts kept");
                return self.conclude_failed(outcome, e.to_string());
            }
        };

        outcome.final_path = Some(report.output_path);
        outcome.duration_secs = report.duration_secs;
        outcome.audio_present = artifact.is_written();
        if !self.config.keep_interim_artifacts {
            remove_interim(&paths.video);
            outcome.video_path = None;
            if let Some(path) = artifact.path() {
                remove_interim(path);
            }
            outcome.audio_path = None;
        }

        self.transition(SessionState::Completed)?;
        outcome.state = SessionState::Completed;
        tracing::info!(
            path = ?outcome.final_path,
            duration_secs = outcome.duration_secs,
            audio = outcome.audio_present,
            "Recording completed"
        );
        self.outcome = Some(outcome.clone());
        self.emit(SessionEvent::Finished {
            outcome: outcome.clone(),
        });
        Ok(outcome)
    }

    fn conclude_failed(
        &mut self,
        mut outcome: RecordingOutcome,
        error: String,
    ) -> SpanrecResult<RecordingOutcome> {
        self.transition(SessionState::Failed)?;
        outcome.state = SessionState::Failed;
        outcome.error = Some(error.clone());
        self.emit(SessionEvent::Error { message: error });
        self.outcome = Some(outcome.clone());
        self.emit(SessionEvent::Finished {
            outcome: outcome.clone(),
        });
        Ok(outcome)
    }

    fn transition(&mut self, next: SessionState) -> SpanrecResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(SpanrecError::invalid_state(format!(
                "Illegal transition {} -> {}",
                self.state, next
            )));
        }
        let from = std::mem::replace(&mut self.state, next);
        tracing::debug!(%from, to = %next, "Session state changed");
        self.emit(SessionEvent::StateChanged { from, to: next });
        Ok(())
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Start { target, reply } => {
                let _ = reply.send(self.start(target).await);
            }
            Command::ChangeRegion { rect, reply } => {
                let _ = reply.send(self.change_region(rect));
            }
            Command::TopologyChanged { reply } => {
                let _ = reply.send(self.topology_changed().await);
            }
            Command::Stop { reply } => {
                let _ = reply.send(self.stop().await);
            }
            Command::State { reply } => {
                let _ = reply.send(self.state);
            }
        }
    }
}

fn enumerate(backend: &dyn CaptureBackend) -> SpanrecResult<DisplayTopology> {
    DisplayTopology::from_monitors(backend.detect_monitors()?)
}

fn join_error(e: tokio::task::JoinError) -> SpanrecError {
    SpanrecError::Io(std::io::Error::other(e))
}

fn remove_interim(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed interim artifact"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove interim artifact"),
    }
}

struct LaunchPlan {
    backend: Arc<dyn CaptureBackend>,
    config: SessionConfig,
    paths: ArtifactPaths,
    topology: SharedTopology,
    target: CaptureTarget,
    time: Arc<dyn TimeSource>,
    faults: mpsc::UnboundedSender<PipelineFault>,
}

struct Launched {
    video: VideoPipeline,
    audio: Option<AudioPipeline>,
    audio_unavailable: Option<String>,
    region: Option<RegionHandle>,
    initial_rect: VirtualDesktopRect,
    geometry: OutputGeometry,
}

/// Blocking half of `start`. Both streams are placed on `plan.time`: video
/// tick `n` is due at `n / fps`, and audio chunks are stamped against the
/// same clock as they arrive.
fn launch(plan: LaunchPlan) -> SpanrecResult<Launched> {
    std::fs::create_dir_all(&plan.config.output_dir)?;

    let mut audio_unavailable = None;
    let audio = if plan.config.capture_audio {
        match open_audio(&plan) {
            Ok(pipeline) => Some(pipeline),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    recoverable = e.is_recoverable(),
                    "Loopback audio unavailable; recording video only"
                );
                audio_unavailable = Some(e.to_string());
                None
            }
        }
    } else {
        tracing::info!("Audio capture disabled");
        None
    };

    match open_video(&plan) {
        Ok((video, region, initial_rect, geometry)) => Ok(Launched {
            video,
            audio,
            audio_unavailable,
            region,
            initial_rect,
            geometry,
        }),
        Err(e) => {
            if let Some(audio) = audio {
                if let Err(close_err) = audio.finish(Duration::from_millis(plan.config.audio_stop_grace_ms)) {
                    tracing::warn!(error = %close_err, "Failed to close audio after start failure");
                }
                remove_interim(&plan.paths.audio);
            }
            Err(e)
        }
    }
}

fn open_audio(plan: &LaunchPlan) -> SpanrecResult<AudioPipeline> {
    let source = plan
        .backend
        .open_loopback(plan.config.audio_sample_rate, plan.config.audio_channels)?;
    let sink = AudioSink::open(&plan.paths.audio)?;
    spawn_audio_pipeline(
        source,
        sink,
        AUDIO_QUEUE_CAPACITY,
        plan.time.clone(),
        plan.faults.clone(),
    )
}

fn open_video(
    plan: &LaunchPlan,
) -> SpanrecResult<(VideoPipeline, Option<RegionHandle>, VirtualDesktopRect, OutputGeometry)> {
    let config = &plan.config;
    let grabber = plan
        .backend
        .open_grabber(&plan.topology.snapshot(), config.fps)?;
    let clock = TickClock::new(config.fps, plan.time.clone());
    let options = config.capture_options();

    let mut source: Box<dyn CaptureSource> = match &plan.target {
        CaptureTarget::Region(rect) => Box::new(RegionCapture::open(
            *rect,
            plan.topology.clone(),
            grabber,
            clock,
            options,
        )?),
        CaptureTarget::Window { window_id } => Box::new(WindowCapture::open(
            plan.backend.open_window_tracker(window_id)?,
            plan.topology.clone(),
            grabber,
            clock,
            options,
        )?),
    };

    let first = source.capture_next()?;
    let (width, height) = first.dimensions();
    let geometry = OutputGeometry::from_dimensions(width, height);
    tracing::info!(%geometry, source = source.name(), "Output geometry fixed by first frame");

    let encoder = plan
        .backend
        .open_encoder(&plan.paths.video, geometry, config.fps, &config.video_codec)?;
    let sink = FrameSink::open(&plan.paths.video, geometry, config.fps, encoder)?;

    let region = source.region_handle();
    let initial_rect = source.active_rect();
    let video = spawn_video_pipeline(
        source,
        first,
        sink,
        config.frame_queue_capacity,
        plan.faults.clone(),
    )?;
    Ok((video, region, initial_rect, geometry))
}

enum Command {
    Start {
        target: CaptureTarget,
        reply: oneshot::Sender<SpanrecResult<()>>,
    },
    ChangeRegion {
        rect: VirtualDesktopRect,
        reply: oneshot::Sender<SpanrecResult<()>>,
    },
    TopologyChanged {
        reply: oneshot::Sender<SpanrecResult<()>>,
    },
    Stop {
        reply: oneshot::Sender<SpanrecResult<RecordingOutcome>>,
    },
    State {
        reply: oneshot::Sender<SessionState>,
    },
}

/// Cloneable front end to a session running on its own task.
///
/// Commands are applied strictly in the order they are sent. Worker faults
/// are handled between commands.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    /// Move `session` onto a tokio task. Must be called within a runtime.
    pub fn spawn(mut session: RecordingSession) -> (Self, tokio::task::JoinHandle<()>) {
        let (commands, receiver) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let events = session.events.clone();
        let faults = session.take_fault_receiver();
        let task = tokio::spawn(run_session(session, receiver, faults));
        (Self { commands, events }, task)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn start(&self, target: CaptureTarget) -> SpanrecResult<()> {
        self.request(|reply| Command::Start { target, reply }).await?
    }

    pub async fn change_region(&self, rect: VirtualDesktopRect) -> SpanrecResult<()> {
        self.request(|reply| Command::ChangeRegion { rect, reply })
            .await?
    }

    pub async fn topology_changed(&self) -> SpanrecResult<()> {
        self.request(|reply| Command::TopologyChanged { reply })
            .await?
    }

    pub async fn stop(&self) -> SpanrecResult<RecordingOutcome> {
        self.request(|reply| Command::Stop { reply }).await?
    }

    pub async fn state(&self) -> SpanrecResult<SessionState> {
        self.request(|reply| Command::State { reply }).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> SpanrecResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SpanrecError::invalid_state("Session task has exited"))?;
        response
            .await
            .map_err(|_| SpanrecError::invalid_state("Session task dropped the request"))
    }
}

async fn run_session(
    mut session: RecordingSession,
    mut commands: mpsc::Receiver<Command>,
    mut faults: Option<mpsc::UnboundedReceiver<PipelineFault>>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => session.handle(command).await,
                None => break,
            },
            Some(fault) = next_fault(&mut faults) => {
                session.fail(fault).await;
            }
        }
    }

    if session.state() == SessionState::Recording {
        tracing::warn!("All session handles dropped while recording; stopping");
        if let Err(e) = session.stop().await {
            tracing::error!(error = %e, "Implicit stop failed");
        }
    }
}

async fn next_fault(
    faults: &mut Option<mpsc::UnboundedReceiver<PipelineFault>>,
) -> Option<PipelineFault> {
    match faults {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn state_table_matches_lifecycle() {
        use SessionState::*;
        let happy = [Idle, Starting, Recording, Stopping, Finalizing, Completed];
        for pair in happy.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(Recording.can_transition_to(RegionChanging));
        assert!(RegionChanging.can_transition_to(Recording));
        assert!(Idle.can_transition_to(Failed));
        assert!(Finalizing.can_transition_to(Failed));

        assert!(!Idle.can_transition_to(Recording));
        assert!(!RegionChanging.can_transition_to(Stopping));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Idle));
        assert!(Completed.is_terminal() && Failed.is_terminal());
        assert!(!Idle.is_terminal());
    }

    #[test]
    fn artifact_paths_share_a_base_name() {
        let paths = ArtifactPaths::new(Path::new("/rec"), "recording_20240102_030405", "mp4");
        assert_eq!(paths.video, PathBuf::from("/rec/recording_20240102_030405.mp4"));
        assert_eq!(paths.audio, PathBuf::from("/rec/recording_20240102_030405_audio.wav"));
        assert_eq!(
            paths.final_output,
            PathBuf::from("/rec/recording_20240102_030405_final.mp4")
        );
    }

    #[test]
    fn base_name_is_timestamped() {
        let at = chrono::Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(timestamped_base_name(at), "recording_20240102_030405");
    }

    #[test]
    fn session_config_follows_app_config() {
        let mut app = AppConfig::default();
        app.recording.fps = 24;
        app.recording.keep_interim_artifacts = true;
        app.recordings_dir = PathBuf::from("/tmp/spanrec-test");
        let config = SessionConfig::from_app_config(&app);
        assert_eq!(config.fps, 24);
        assert!(config.keep_interim_artifacts);
        assert_eq!(config.output_dir, PathBuf::from("/tmp/spanrec-test"));
        assert_eq!(config.capture_options().retry_ticks, 30);
    }

    #[test]
    fn events_serialize_with_tag() {
        let event = SessionEvent::StateChanged {
            from: SessionState::Recording,
            to: SessionState::RegionChanging,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "state_changed");
        assert_eq!(json["to"], "region_changing");
    }
}
