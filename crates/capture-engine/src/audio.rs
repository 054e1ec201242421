//! Loopback audio chunks and sources.

use std::io::{ErrorKind, Read};
use std::sync::Arc;

use spanrec_common::error::{SpanrecError, SpanrecResult};

/// Interleaved `f32` samples in `[-1.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Position of the first sample. Sources count from their own first
    /// sample; the audio pipeline rebases chunks onto the recording
    /// timeline, where it may be negative.
    pub timestamp_ns: i64,
}

impl AudioChunk {
    /// Number of sample frames (one sample per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn duration_ns(&self) -> u64 {
        self.frames() as u64 * 1_000_000_000 / self.sample_rate.max(1) as u64
    }
}

/// Called from another thread to unblock a source stuck in `read_next`.
pub type InterruptHandle = Arc<dyn Fn() + Send + Sync>;

/// Produces the system's audio output as timestamped chunks.
pub trait AudioSource: Send {
    /// Block until a chunk is available. `Ok(None)` means the stream ended.
    fn read_next(&mut self) -> SpanrecResult<Option<AudioChunk>>;

    fn name(&self) -> String;

    fn interrupt_handle(&self) -> Option<InterruptHandle> {
        None
    }
}

/// Splits a raw little-endian `f32` interleaved stream into fixed-size chunks.
pub struct F32leChunkReader<R> {
    reader: R,
    sample_rate: u32,
    channels: u16,
    frames_per_chunk: usize,
    frames_read: u64,
    buf: Vec<u8>,
}

impl<R: Read> F32leChunkReader<R> {
    pub fn new(reader: R, sample_rate: u32, channels: u16, frames_per_chunk: usize) -> Self {
        let channels = channels.max(1);
        Self {
            reader,
            sample_rate: sample_rate.max(1),
            channels,
            frames_per_chunk: frames_per_chunk.max(1),
            frames_read: 0,
            buf: vec![0; frames_per_chunk.max(1) * channels as usize * 4],
        }
    }

    /// Read one chunk. A short read at end of stream yields a final partial
    /// chunk trimmed to whole frames.
    pub fn read_chunk(&mut self) -> SpanrecResult<Option<AudioChunk>> {
        let mut filled = 0;
        while filled < self.buf.len() {
            match self.reader.read(&mut self.buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(SpanrecError::audio(format!("Loopback read failed: {e}")));
                }
            }
        }

        let frame_bytes = self.channels as usize * 4;
        let usable = filled - filled % frame_bytes;
        if usable == 0 {
            return Ok(None);
        }

        let samples: Vec<f32> = self.buf[..usable]
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        let timestamp_ns = (self.frames_read * 1_000_000_000 / self.sample_rate as u64) as i64;
        self.frames_read += (usable / frame_bytes) as u64;

        Ok(Some(AudioChunk {
            samples,
            sample_rate: self.sample_rate,
            channels: self.channels,
            timestamp_ns,
        }))
    }
}

impl<R: Read + Send> AudioSource for F32leChunkReader<R> {
    fn read_next(&mut self) -> SpanrecResult<Option<AudioChunk>> {
        self.read_chunk()
    }

    fn name(&self) -> String {
        format!("f32le {}Hz x{}", self.sample_rate, self.channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encode(samples: &[f32]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn chunks_carry_running_timestamps() {
        let samples: Vec<f32> = (0..20).map(|i| i as f32 / 100.0).collect();
        let mut reader = F32leChunkReader::new(Cursor::new(encode(&samples)), 4, 2, 4);

        let first = reader.read_chunk().unwrap().unwrap();
        assert_eq!(first.frames(), 4);
        assert_eq!(first.timestamp_ns, 0);
        assert_eq!(first.samples[..2], [0.0, 0.01]);

        let second = reader.read_chunk().unwrap().unwrap();
        assert_eq!(second.timestamp_ns, 1_000_000_000);

        // 2 frames left of the 10 written.
        let tail = reader.read_chunk().unwrap().unwrap();
        assert_eq!(tail.frames(), 2);
        assert_eq!(tail.timestamp_ns, 2_000_000_000);

        assert!(reader.read_chunk().unwrap().is_none());
    }

    #[test]
    fn dangling_partial_frame_is_dropped() {
        // 3 samples of a stereo stream: one whole frame plus half of another.
        let mut reader = F32leChunkReader::new(Cursor::new(encode(&[0.1, 0.2, 0.3])), 48000, 2, 1024);
        let chunk = reader.read_chunk().unwrap().unwrap();
        assert_eq!(chunk.samples, vec![0.1, 0.2]);
        assert!(reader.read_chunk().unwrap().is_none());
    }

    #[test]
    fn duration_follows_sample_rate() {
        let chunk = AudioChunk {
            samples: vec![0.0; 48000 * 2],
            sample_rate: 48000,
            channels: 2,
            timestamp_ns: 0,
        };
        assert_eq!(chunk.duration_ns(), 1_000_000_000);
    }
}
