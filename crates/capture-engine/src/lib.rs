//! Spanrec Capture Engine
//!
//! Records a region of the virtual desktop (possibly spanning monitors)
//! together with system loopback audio, then muxes both into one file.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                  RecordingSession                     │
//! │  ┌───────────────┐              ┌──────────────────┐  │
//! │  │ CaptureSource │              │   AudioSource    │  │
//! │  │ (tick clock)  │              │ (loopback mon.)  │  │
//! │  └───────┬───────┘              └────────┬─────────┘  │
//! │          │ bounded queue                 │ queue      │
//! │          ▼ (drop oldest)                 ▼            │
//! │  ┌───────────────┐              ┌──────────────────┐  │
//! │  │   FrameSink   │              │    AudioSink     │  │
//! │  │  base.mp4     │              │  base_audio.wav  │  │
//! │  └───────┬───────┘              └────────┬─────────┘  │
//! │          └──────────────┬────────────────┘            │
//! │                         ▼                             │
//! │                ┌─────────────────┐                    │
//! │                │      Muxer      │  base_final.mp4    │
//! │                └─────────────────┘                    │
//! └───────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod backend;
pub mod frame;
pub mod mux;
pub mod pipeline;
pub mod session;
pub mod sink;
pub mod source;

pub use backend::{get_backend, CaptureBackend};
pub use frame::{CaptureFrame, OutputGeometry};
pub use mux::{AudioAdjustment, FfmpegMuxer, MuxPlan, MuxReport, MuxRequest, Muxer};
pub use session::*;
