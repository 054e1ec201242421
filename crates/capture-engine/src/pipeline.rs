//! Producer/consumer workers for the video and audio pipelines.
//!
//! Each pipeline is a capture thread and a writer thread joined by a
//! [`FrameQueue`]. The two pipelines share nothing, so a slow disk on one
//! side never stalls the other.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;
use spanrec_common::clock::TimeSource;
use spanrec_common::error::{SpanrecError, SpanrecResult};
use tokio::sync::mpsc::UnboundedSender;

use crate::audio::{AudioChunk, AudioSource, InterruptHandle};
use crate::frame::CaptureFrame;
use crate::sink::{AudioArtifact, AudioSink, FrameSink, FrameSinkSummary};
use crate::source::{CaptureSource, CaptureStats};

/// Audio chunks buffered between reader and writer (about 10 s at 1024-frame
/// chunks and 48 kHz).
pub const AUDIO_QUEUE_CAPACITY: usize = 512;

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Bounded FIFO that never blocks the producer: when full, the oldest item
/// is evicted to make room.
pub struct FrameQueue<T> {
    state: Mutex<QueueState<T>>,
    ready: Condvar,
    capacity: usize,
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> FrameQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            ready: Condvar::new(),
            capacity,
        }
    }

    /// Enqueue `item`. Returns whatever had to be discarded: the evicted
    /// oldest item, or `item` itself when the queue is already closed.
    pub fn push(&self, item: T) -> Option<T> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return Some(item);
        }
        let evicted = if state.items.len() >= self.capacity {
            state.items.pop_front()
        } else {
            None
        };
        state.items.push_back(item);
        drop(state);
        self.ready.notify_one();
        evicted
    }

    /// Block until an item is available. `None` once the queue is closed
    /// and drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state = self.ready.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Refuse new items; consumers still drain what is queued.
    pub fn close(&self) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).closed = true;
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Runtime statistics from one pipeline. For audio the unit is chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PipelineStats {
    /// Items produced by the capture worker.
    pub frames_captured: u64,

    /// Items evicted from a full queue.
    pub frames_dropped: u64,

    /// Items the writer handed to its sink.
    pub frames_written: u64,

    /// Repeats the sink inserted to cover dropped items.
    pub gap_fills: u64,
}

impl PipelineStats {
    /// Drop rate as a percentage.
    pub fn drop_rate(&self) -> f64 {
        if self.frames_captured == 0 {
            return 0.0;
        }
        self.frames_dropped as f64 / self.frames_captured as f64 * 100.0
    }
}

#[derive(Debug, Default)]
struct PipelineCounters {
    captured: AtomicU64,
    dropped: AtomicU64,
    written: AtomicU64,
}

impl PipelineCounters {
    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            frames_captured: self.captured.load(Ordering::Relaxed),
            frames_dropped: self.dropped.load(Ordering::Relaxed),
            frames_written: self.written.load(Ordering::Relaxed),
            gap_fills: 0,
        }
    }
}

/// An unrecoverable error raised on a worker thread. The error itself is
/// returned when the pipeline is joined; this is the early warning.
#[derive(Debug, Clone)]
pub struct PipelineFault {
    pub pipeline: &'static str,
    pub message: String,
}

fn report_fault(faults: &UnboundedSender<PipelineFault>, pipeline: &'static str, error: &SpanrecError) {
    // The session may already be gone.
    let _ = faults.send(PipelineFault {
        pipeline,
        message: error.to_string(),
    });
}

fn worker_panicked(name: &str) -> SpanrecError {
    SpanrecError::capture_source(format!("{name} worker panicked"))
}

/// Everything the video pipeline produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoReport {
    pub sink: FrameSinkSummary,
    pub capture: CaptureStats,
    pub pipeline: PipelineStats,
}

/// Running capture source → frame sink pipeline.
pub struct VideoPipeline {
    stop: Arc<AtomicBool>,
    counters: Arc<PipelineCounters>,
    capture: Option<JoinHandle<SpanrecResult<CaptureStats>>>,
    writer: Option<JoinHandle<SpanrecResult<FrameSinkSummary>>>,
}

/// Start the video workers. `first` is the frame the session already
/// captured to fix the output geometry; it is written before anything else.
pub fn spawn_video_pipeline(
    mut source: Box<dyn CaptureSource>,
    first: CaptureFrame,
    mut sink: FrameSink,
    queue_capacity: usize,
    faults: UnboundedSender<PipelineFault>,
) -> SpanrecResult<VideoPipeline> {
    let stop = Arc::new(AtomicBool::new(false));
    let queue = Arc::new(FrameQueue::<CaptureFrame>::new(queue_capacity));
    let counters = Arc::new(PipelineCounters::default());
    // Written by the capture worker before it closes the queue.
    let total_ticks = Arc::new(AtomicU64::new(0));

    counters.captured.fetch_add(1, Ordering::Relaxed);
    queue.push(first);

    let capture = {
        let stop = stop.clone();
        let queue = queue.clone();
        let counters = counters.clone();
        let total_ticks = total_ticks.clone();
        let faults = faults.clone();
        std::thread::Builder::new()
            .name("spanrec-video-capture".into())
            .spawn(move || -> SpanrecResult<CaptureStats> {
                let mut failure = None;
                while !stop.load(Ordering::SeqCst) {
                    match source.capture_next() {
                        Ok(frame) => {
                            counters.captured.fetch_add(1, Ordering::Relaxed);
                            if let Some(dropped) = queue.push(frame) {
                                counters.dropped.fetch_add(1, Ordering::Relaxed);
                                tracing::warn!(
                                    sequence = dropped.sequence,
                                    "Frame queue full; dropped oldest frame"
                                );
                            }
                        }
                        Err(e) => {
                            tracing::error!(source = source.name(), error = %e, "Capture source failed");
                            report_fault(&faults, "video", &e);
                            failure = Some(e);
                            break;
                        }
                    }
                }
                let stats = source.stats();
                total_ticks.store(stats.ticks, Ordering::SeqCst);
                queue.close();
                tracing::debug!(ticks = stats.ticks, "Video capture worker exiting");
                match failure {
                    Some(e) => Err(e),
                    None => Ok(stats),
                }
            })?
    };

    let writer = {
        let stop = stop.clone();
        let counters = counters.clone();
        let queue = queue.clone();
        std::thread::Builder::new()
            .name("spanrec-video-writer".into())
            .spawn(move || -> SpanrecResult<FrameSinkSummary> {
                while let Some(frame) = queue.pop() {
                    if let Err(e) = sink.write(frame) {
                        tracing::error!(error = %e, "Frame sink write failed");
                        report_fault(&faults, "video", &e);
                        stop.store(true, Ordering::SeqCst);
                        // Keep whatever already reached the container.
                        if let Err(close_err) = sink.close() {
                            tracing::warn!(error = %close_err, "Failed to close frame sink after write error");
                        }
                        return Err(e);
                    }
                    counters.written.fetch_add(1, Ordering::Relaxed);
                }
                sink.fill_to(total_ticks.load(Ordering::SeqCst))?;
                let summary = sink.close()?;
                tracing::info!(frames = summary.frames_written, "Video pipeline drained");
                Ok(summary)
            })
    };
    let writer = match writer {
        Ok(handle) => handle,
        Err(e) => {
            stop.store(true, Ordering::SeqCst);
            queue.close();
            return Err(e.into());
        }
    };

    Ok(VideoPipeline {
        stop,
        counters,
        capture: Some(capture),
        writer: Some(writer),
    })
}

impl VideoPipeline {
    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    /// Ask the capture worker to stop after its current tick.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Stop capturing, drain the queue, and close the sink. Blocks.
    pub fn finish(mut self) -> SpanrecResult<VideoReport> {
        self.request_stop();

        let capture = match self.capture.take().map(JoinHandle::join) {
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(worker_panicked("video capture")),
            None => Err(SpanrecError::invalid_state("Video pipeline already finished")),
        };
        let writer = match self.writer.take().map(JoinHandle::join) {
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(worker_panicked("video writer")),
            None => Err(SpanrecError::invalid_state("Video pipeline already finished")),
        };

        // Capture errors are the root cause when both sides failed.
        let capture = capture?;
        let sink = writer?;
        let mut pipeline = self.counters.snapshot();
        pipeline.gap_fills = sink.gap_fills;

        tracing::info!(
            captured = pipeline.frames_captured,
            dropped = pipeline.frames_dropped,
            written = sink.frames_written,
            duplicates = capture.duplicates(),
            drop_rate = pipeline.drop_rate(),
            "Video pipeline finished"
        );

        Ok(VideoReport {
            sink,
            capture,
            pipeline,
        })
    }
}

impl Drop for VideoPipeline {
    fn drop(&mut self) {
        self.request_stop();
    }
}

/// Places source-relative chunk timestamps on the recording timeline.
///
/// The first chunk is taken to have been captured one chunk length before
/// it was delivered. Later chunks keep their distance from the first, so
/// sample clock and recording clock agree on one common zero.
pub struct TimelineAnchor {
    time: Arc<dyn TimeSource>,
    offset_ns: Option<i64>,
}

impl TimelineAnchor {
    pub fn new(time: Arc<dyn TimeSource>) -> Self {
        Self {
            time,
            offset_ns: None,
        }
    }

    /// Rebase `chunk` onto the recording timeline.
    pub fn place(&mut self, mut chunk: AudioChunk) -> AudioChunk {
        let offset = match self.offset_ns {
            Some(offset) => offset,
            None => {
                let delivered_ns = self.time.now_ns() as i64;
                let offset = delivered_ns - chunk.duration_ns() as i64 - chunk.timestamp_ns;
                tracing::debug!(
                    delivered_ms = delivered_ns / 1_000_000,
                    offset_ms = offset / 1_000_000,
                    "Audio anchored to recording timeline"
                );
                self.offset_ns = Some(offset);
                offset
            }
        };
        chunk.timestamp_ns += offset;
        chunk
    }

    /// Shift applied to every chunk, once the first one arrived.
    pub fn offset_ns(&self) -> Option<i64> {
        self.offset_ns
    }
}

/// Everything the audio pipeline produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioReport {
    pub artifact: AudioArtifact,
    pub pipeline: PipelineStats,
    /// The reader never returned and was left behind.
    pub detached: bool,
}

/// Running audio source → audio sink pipeline.
pub struct AudioPipeline {
    stop: Arc<AtomicBool>,
    queue: Arc<FrameQueue<AudioChunk>>,
    counters: Arc<PipelineCounters>,
    interrupt: Option<InterruptHandle>,
    capture: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<SpanrecResult<AudioArtifact>>>,
}

/// Start the audio workers. Chunk timestamps are rebased onto `time`, the
/// clock video ticks are scheduled on.
pub fn spawn_audio_pipeline(
    mut source: Box<dyn AudioSource>,
    mut sink: AudioSink,
    queue_capacity: usize,
    time: Arc<dyn TimeSource>,
    faults: UnboundedSender<PipelineFault>,
) -> SpanrecResult<AudioPipeline> {
    let stop = Arc::new(AtomicBool::new(false));
    let queue = Arc::new(FrameQueue::<AudioChunk>::new(queue_capacity));
    let counters = Arc::new(PipelineCounters::default());
    let interrupt = source.interrupt_handle();
    let name = source.name();

    let capture = {
        let stop = stop.clone();
        let queue = queue.clone();
        let counters = counters.clone();
        std::thread::Builder::new()
            .name("spanrec-audio-capture".into())
            .spawn(move || {
                let mut anchor = TimelineAnchor::new(time);
                while !stop.load(Ordering::SeqCst) {
                    match source.read_next() {
                        Ok(Some(chunk)) => {
                            let chunk = anchor.place(chunk);
                            counters.captured.fetch_add(1, Ordering::Relaxed);
                            if let Some(dropped) = queue.push(chunk) {
                                counters.dropped.fetch_add(1, Ordering::Relaxed);
                                tracing::warn!(
                                    timestamp_ns = dropped.timestamp_ns,
                                    "Audio queue full; dropped oldest chunk"
                                );
                            }
                        }
                        Ok(None) => {
                            tracing::debug!("Audio stream ended");
                            break;
                        }
                        Err(e) => {
                            if !stop.load(Ordering::SeqCst) {
                                // The captured prefix stays usable; the
                                // muxer pads the remainder with silence.
                                tracing::warn!(error = %e, "Audio capture ended early");
                            }
                            break;
                        }
                    }
                }
                queue.close();
            })?
    };

    let writer = {
        let stop = stop.clone();
        let queue = queue.clone();
        let counters = counters.clone();
        std::thread::Builder::new()
            .name("spanrec-audio-writer".into())
            .spawn(move || -> SpanrecResult<AudioArtifact> {
                while let Some(chunk) = queue.pop() {
                    if let Err(e) = sink.write(&chunk) {
                        tracing::error!(error = %e, "Audio sink write failed");
                        report_fault(&faults, "audio", &e);
                        stop.store(true, Ordering::SeqCst);
                        queue.close();
                        if let Err(close_err) = sink.close() {
                            tracing::warn!(error = %close_err, "Failed to close audio sink after write error");
                        }
                        return Err(e);
                    }
                    counters.written.fetch_add(1, Ordering::Relaxed);
                }
                sink.close()
            })
    };
    let writer = match writer {
        Ok(handle) => handle,
        Err(e) => {
            stop.store(true, Ordering::SeqCst);
            queue.close();
            return Err(e.into());
        }
    };

    tracing::info!(source = %name, "Audio pipeline started");

    Ok(AudioPipeline {
        stop,
        queue,
        counters,
        interrupt,
        capture: Some(capture),
        writer: Some(writer),
    })
}

impl AudioPipeline {
    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    /// Stop reading and close the sink. A reader still blocked after
    /// `grace` is interrupted; one that ignores the interrupt for another
    /// `grace` is detached. Blocks.
    pub fn finish(mut self, grace: Duration) -> SpanrecResult<AudioReport> {
        self.stop.store(true, Ordering::SeqCst);

        let mut detached = false;
        if let Some(capture) = self.capture.take() {
            let mut finished = wait_finished(&capture, grace);
            if !finished {
                if let Some(interrupt) = &self.interrupt {
                    tracing::warn!(grace_ms = grace.as_millis() as u64, "Audio reader still blocked; interrupting");
                    interrupt();
                    finished = wait_finished(&capture, grace);
                }
            }
            if finished {
                if capture.join().is_err() {
                    tracing::warn!("Audio capture worker panicked");
                }
            } else {
                tracing::warn!("Audio reader is hung; detaching it");
                detached = true;
            }
        }
        // Releases the writer even when the reader is detached.
        self.queue.close();

        let artifact = match self.writer.take().map(JoinHandle::join) {
            Some(Ok(result)) => result?,
            Some(Err(_)) => return Err(worker_panicked("audio writer")),
            None => return Err(SpanrecError::invalid_state("Audio pipeline already finished")),
        };

        let pipeline = self.counters.snapshot();
        tracing::info!(
            chunks = pipeline.frames_written,
            dropped = pipeline.frames_dropped,
            detached,
            "Audio pipeline finished"
        );

        Ok(AudioReport {
            artifact,
            pipeline,
            detached,
        })
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.queue.close();
    }
}

fn wait_finished<T>(handle: &JoinHandle<T>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(JOIN_POLL_INTERVAL);
    }
    true
}
