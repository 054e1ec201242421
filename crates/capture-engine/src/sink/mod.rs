//! Output sinks for the two pipelines.

pub mod audio_sink;
pub mod frame_sink;

pub use audio_sink::{read_wav_artifact, AudioArtifact, AudioSink};
pub use frame_sink::{FrameSink, FrameSinkSummary, VideoEncoder};
