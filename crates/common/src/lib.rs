//! spanrec Common Utilities
//!
//! Shared infrastructure for all spanrec crates:
//! - Error taxonomy and result aliases
//! - Recording and tick clocks for stream timing
//! - Tracing/logging initialization
//! - Configuration loading

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;

pub use clock::*;
pub use config::*;
pub use error::*;
