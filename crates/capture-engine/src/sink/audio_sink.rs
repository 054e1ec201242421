//! Interim 16-bit PCM WAV writer for loopback audio.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use serde::Serialize;
use spanrec_common::error::{SpanrecError, SpanrecResult};

use crate::audio::AudioChunk;

/// Chunks between header rewrites, so a crashed session still leaves a
/// readable file (about a second at 1024-frame chunks and 48 kHz).
const FLUSH_EVERY_CHUNKS: u32 = 48;

/// Largest data chunk a RIFF header can describe.
const MAX_DATA_BYTES: u64 = u32::MAX as u64 - 36;

/// Result of closing an [`AudioSink`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AudioArtifact {
    Written {
        path: PathBuf,
        sample_rate: u32,
        channels: u16,
        frames: u64,
        duration_secs: f64,
        /// Where the first sample sits on the recording timeline. Positive
        /// when audio started after video tick 0.
        start_offset_secs: f64,
    },
    /// Nothing was captured; no file was left behind.
    Absent,
}

impl AudioArtifact {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Written { path, .. } => Some(path),
            Self::Absent => None,
        }
    }

    pub fn duration_secs(&self) -> Option<f64> {
        match self {
            Self::Written { duration_secs, .. } => Some(*duration_secs),
            Self::Absent => None,
        }
    }

    pub fn start_offset_secs(&self) -> f64 {
        match self {
            Self::Written {
                start_offset_secs, ..
            } => *start_offset_secs,
            Self::Absent => 0.0,
        }
    }

    /// Timeline position just past the last sample.
    pub fn end_secs(&self) -> Option<f64> {
        self.duration_secs()
            .map(|duration| self.start_offset_secs() + duration)
    }

    pub fn is_written(&self) -> bool {
        matches!(self, Self::Written { .. })
    }

    /// The same artifact placed at `start_offset_secs` on the timeline.
    pub fn with_start_offset(self, offset: f64) -> Self {
        match self {
            Self::Written {
                path,
                sample_rate,
                channels,
                frames,
                duration_secs,
                ..
            } => Self::Written {
                path,
                sample_rate,
                channels,
                frames,
                duration_secs,
                start_offset_secs: offset,
            },
            Self::Absent => Self::Absent,
        }
    }
}

fn wav_error(path: &Path, e: hound::Error) -> SpanrecError {
    match e {
        hound::Error::IoError(io) if io.kind() == std::io::ErrorKind::NotFound => {
            SpanrecError::FileNotFound {
                path: path.to_path_buf(),
            }
        }
        other => SpanrecError::audio(format!("{}: {other}", path.display())),
    }
}

/// Describe an existing 16-bit PCM WAV file, such as an interim artifact
/// kept from an earlier session. A file without samples is `Absent`.
///
/// A bare WAV carries no timeline position, so the artifact starts at zero.
pub fn read_wav_artifact(path: &Path) -> SpanrecResult<AudioArtifact> {
    let reader = WavReader::open(path).map_err(|e| wav_error(path, e))?;
    let spec = reader.spec();
    if spec.bits_per_sample != 16 || spec.sample_format != SampleFormat::Int {
        return Err(SpanrecError::audio(format!(
            "{}: expected 16-bit PCM, found {}-bit {:?}",
            path.display(),
            spec.bits_per_sample,
            spec.sample_format
        )));
    }

    let frames = reader.duration() as u64;
    if frames == 0 {
        return Ok(AudioArtifact::Absent);
    }
    Ok(AudioArtifact::Written {
        path: path.to_path_buf(),
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        frames,
        duration_secs: frames as f64 / spec.sample_rate as f64,
        start_offset_secs: 0.0,
    })
}

/// Appends chunks to a WAV file as they arrive.
///
/// The first chunk fixes the format and the timeline position of the file.
/// Later chunks whose timestamps leave a hole (chunks dropped upstream) are
/// preceded by silence, so sample `n` always sits `n / rate` seconds after
/// the first one.
pub struct AudioSink {
    path: PathBuf,
    file: Option<File>,
    writer: Option<WavWriter<BufWriter<File>>>,
    spec: Option<WavSpec>,
    start_ns: i64,
    frames: u64,
    silence_frames: u64,
    unflushed_chunks: u32,
    result: Option<AudioArtifact>,
}

impl AudioSink {
    pub fn open(path: impl Into<PathBuf>) -> SpanrecResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&path).map_err(|e| {
            SpanrecError::sink_write(format!("Cannot create {}: {e}", path.display()))
        })?;
        tracing::debug!(path = %path.display(), "Audio sink opened");
        Ok(Self {
            path,
            file: Some(file),
            writer: None,
            spec: None,
            start_ns: 0,
            frames: 0,
            silence_frames: 0,
            unflushed_chunks: 0,
            result: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Frames of silence inserted to cover dropped chunks.
    pub fn silence_frames(&self) -> u64 {
        self.silence_frames
    }

    pub fn write(&mut self, chunk: &AudioChunk) -> SpanrecResult<()> {
        if self.result.is_some() {
            return Err(SpanrecError::sink_write("Audio sink is already closed"));
        }
        if chunk.samples.is_empty() {
            return Ok(());
        }

        let spec = match self.spec {
            Some(spec) => {
                if (spec.sample_rate, spec.channels) != (chunk.sample_rate, chunk.channels) {
                    return Err(SpanrecError::sink_write(format!(
                        "Audio format changed mid-stream from {}Hz x{} to {}Hz x{}",
                        spec.sample_rate, spec.channels, chunk.sample_rate, chunk.channels
                    )));
                }
                spec
            }
            None => self.begin(chunk)?,
        };

        let gap = self.gap_frames(chunk.timestamp_ns, spec.sample_rate);
        let added = (gap + chunk.frames() as u64) * spec.channels as u64 * 2;
        if (self.frames * spec.channels as u64 * 2) + added > MAX_DATA_BYTES {
            return Err(SpanrecError::sink_write("WAV file would exceed 4 GiB"));
        }

        let path = self.path.clone();
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| SpanrecError::sink_write("Audio sink has no open file"))?;
        let write_failed =
            |e: hound::Error| SpanrecError::sink_write(format!("Audio write to {} failed: {e}", path.display()));

        if gap > 0 {
            tracing::warn!(
                frames = gap,
                timestamp_ns = chunk.timestamp_ns,
                "Audio chunks missing; writing silence"
            );
            for _ in 0..gap * spec.channels as u64 {
                writer.write_sample(0i16).map_err(write_failed)?;
            }
            self.frames += gap;
            self.silence_frames += gap;
        }

        for sample in &chunk.samples {
            let pcm = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer.write_sample(pcm).map_err(write_failed)?;
        }
        self.frames += chunk.frames() as u64;

        self.unflushed_chunks += 1;
        if self.unflushed_chunks >= FLUSH_EVERY_CHUNKS {
            self.flush()?;
        }
        Ok(())
    }

    /// Rewrite the header sizes so the file is readable as it stands.
    pub fn flush(&mut self) -> SpanrecResult<()> {
        self.unflushed_chunks = 0;
        match self.writer.as_mut() {
            Some(writer) => writer.flush().map_err(|e| {
                SpanrecError::sink_write(format!("WAV flush of {} failed: {e}", self.path.display()))
            }),
            None => Ok(()),
        }
    }

    /// Finalize the header and close the file, or remove it when nothing
    /// was written. Safe to call more than once.
    pub fn close(&mut self) -> SpanrecResult<AudioArtifact> {
        if let Some(result) = &self.result {
            return Ok(result.clone());
        }

        let result = match (self.writer.take(), self.spec) {
            (Some(writer), Some(spec)) => {
                writer.finalize().map_err(|e| {
                    SpanrecError::sink_write(format!(
                        "Failed to finalize {}: {e}",
                        self.path.display()
                    ))
                })?;

                let artifact = AudioArtifact::Written {
                    path: self.path.clone(),
                    sample_rate: spec.sample_rate,
                    channels: spec.channels,
                    frames: self.frames,
                    duration_secs: self.frames as f64 / spec.sample_rate as f64,
                    start_offset_secs: self.start_ns as f64 / 1_000_000_000.0,
                };
                tracing::info!(
                    path = %self.path.display(),
                    frames = self.frames,
                    silence_frames = self.silence_frames,
                    start_offset_ms = self.start_ns / 1_000_000,
                    duration_secs = artifact.duration_secs().unwrap_or(0.0),
                    "Audio sink closed"
                );
                artifact
            }
            (None, Some(_)) => {
                return Err(SpanrecError::sink_write(
                    "Audio file was released after an earlier failure",
                ));
            }
            (_, None) => {
                drop(self.file.take());
                if let Err(e) = std::fs::remove_file(&self.path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove empty audio file");
                    }
                }
                tracing::info!("No audio captured; audio artifact absent");
                AudioArtifact::Absent
            }
        };

        self.result = Some(result.clone());
        Ok(result)
    }

    /// Hand the file to the WAV encoder with the first chunk's format.
    fn begin(&mut self, chunk: &AudioChunk) -> SpanrecResult<WavSpec> {
        if chunk.channels == 0 || chunk.sample_rate == 0 {
            return Err(SpanrecError::sink_write("Audio chunk has an empty format"));
        }
        let spec = WavSpec {
            channels: chunk.channels,
            sample_rate: chunk.sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let file = self
            .file
            .take()
            .ok_or_else(|| SpanrecError::sink_write("Audio sink has no open file"))?;
        let writer = WavWriter::new(BufWriter::new(file), spec)
            .map_err(|e| SpanrecError::sink_write(format!("WAV header write failed: {e}")))?;

        self.writer = Some(writer);
        self.spec = Some(spec);
        self.start_ns = chunk.timestamp_ns;
        tracing::debug!(
            sample_rate = spec.sample_rate,
            channels = spec.channels,
            start_offset_ms = chunk.timestamp_ns / 1_000_000,
            "First audio chunk written"
        );
        Ok(spec)
    }

    /// Whole frames between the end of what was written and `timestamp_ns`.
    fn gap_frames(&self, timestamp_ns: i64, sample_rate: u32) -> u64 {
        let written_ns = (self.frames as i128 * 1_000_000_000 / sample_rate as i128) as i64;
        let behind_ns = timestamp_ns - self.start_ns - written_ns;
        if behind_ns <= 0 {
            return 0;
        }
        (behind_ns as i128 * sample_rate as i128 / 1_000_000_000) as u64
    }
}

impl Drop for AudioSink {
    fn drop(&mut self) {
        if self.result.is_none() {
            if let Err(e) = self.close() {
                tracing::warn!(error = %e, "Failed to finalize audio sink on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("spanrec-audio-sink-{}-{name}.wav", std::process::id()))
    }

    fn chunk_at(timestamp_ns: i64, frames: usize, rate: u32, channels: u16) -> AudioChunk {
        AudioChunk {
            samples: vec![0.5; frames * channels as usize],
            sample_rate: rate,
            channels,
            timestamp_ns,
        }
    }

    fn chunk(frames: usize, rate: u32, channels: u16) -> AudioChunk {
        chunk_at(0, frames, rate, channels)
    }

    fn samples(path: &Path) -> Vec<i16> {
        WavReader::open(path)
            .unwrap()
            .samples::<i16>()
            .map(Result::unwrap)
            .collect()
    }

    #[test]
    fn closed_file_holds_every_sample() {
        let path = temp_path("closed");
        let mut sink = AudioSink::open(&path).unwrap();
        sink.write(&chunk_at(0, 100, 8000, 2)).unwrap();
        sink.write(&chunk_at(12_500_000, 60, 8000, 2)).unwrap();
        let artifact = sink.close().unwrap();

        let reader = WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 8000);
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.duration(), 160);
        let written = samples(&path);
        assert_eq!(written.len(), 320);
        assert!(written.iter().all(|s| *s == (0.5 * i16::MAX as f32) as i16));

        assert!(matches!(
            artifact,
            AudioArtifact::Written { frames: 160, sample_rate: 8000, channels: 2, .. }
        ));
        assert!((artifact.duration_secs().unwrap() - 0.02).abs() < 1e-9);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn no_chunks_means_absent_and_no_file() {
        let path = temp_path("absent");
        let mut sink = AudioSink::open(&path).unwrap();
        assert_eq!(sink.close().unwrap(), AudioArtifact::Absent);
        assert!(!path.exists());
        // Idempotent.
        assert_eq!(sink.close().unwrap(), AudioArtifact::Absent);
    }

    #[test]
    fn format_change_is_rejected() {
        let path = temp_path("format");
        let mut sink = AudioSink::open(&path).unwrap();
        sink.write(&chunk(10, 48000, 2)).unwrap();
        let err = sink.write(&chunk(10, 44100, 2)).unwrap_err();
        assert!(matches!(err, SpanrecError::SinkWrite { .. }));
        sink.close().unwrap();
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn samples_are_clamped() {
        let path = temp_path("clamp");
        let mut sink = AudioSink::open(&path).unwrap();
        sink.write(&AudioChunk {
            samples: vec![2.0, -3.0],
            sample_rate: 48000,
            channels: 2,
            timestamp_ns: 0,
        })
        .unwrap();
        sink.close().unwrap();
        assert_eq!(samples(&path), vec![i16::MAX, -i16::MAX]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn first_chunk_fixes_the_start_offset() {
        let path = temp_path("offset");
        let mut sink = AudioSink::open(&path).unwrap();
        sink.write(&chunk_at(400_000_000, 800, 8000, 1)).unwrap();
        sink.write(&chunk_at(500_000_000, 800, 8000, 1)).unwrap();
        let artifact = sink.close().unwrap();

        assert!((artifact.start_offset_secs() - 0.4).abs() < 1e-9);
        assert!((artifact.end_secs().unwrap() - 0.6).abs() < 1e-9);
        assert_eq!(sink.silence_frames(), 0);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn dropped_chunks_become_silence() {
        let path = temp_path("gap");
        let mut sink = AudioSink::open(&path).unwrap();
        // 10 ms chunks at 8 kHz; the one at 10 ms never arrives.
        sink.write(&chunk_at(0, 80, 8000, 1)).unwrap();
        sink.write(&chunk_at(20_000_000, 80, 8000, 1)).unwrap();
        let artifact = sink.close().unwrap();

        assert_eq!(sink.silence_frames(), 80);
        assert!(matches!(artifact, AudioArtifact::Written { frames: 240, .. }));
        let written = samples(&path);
        assert!(written[80..160].iter().all(|s| *s == 0));
        assert!(written[160..].iter().all(|s| *s != 0));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn written_file_reads_back_as_the_same_artifact() {
        let path = temp_path("read-back");
        let mut sink = AudioSink::open(&path).unwrap();
        sink.write(&chunk(4800, 48000, 2)).unwrap();
        let artifact = sink.close().unwrap();
        assert_eq!(read_wav_artifact(&path).unwrap(), artifact);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn flushed_file_is_readable_while_recording() {
        let path = temp_path("flushed");
        let mut sink = AudioSink::open(&path).unwrap();
        sink.write(&chunk(800, 8000, 1)).unwrap();
        sink.flush().unwrap();

        let artifact = read_wav_artifact(&path).unwrap();
        assert!(matches!(artifact, AudioArtifact::Written { frames: 800, .. }));

        sink.close().unwrap();
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_wav_is_file_not_found() {
        let err = read_wav_artifact(&temp_path("does-not-exist")).unwrap_err();
        assert!(matches!(err, SpanrecError::FileNotFound { .. }));
    }
}
