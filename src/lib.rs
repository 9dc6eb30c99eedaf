//! speechflow - concurrent packet pipeline for speech dialog systems
//!
//! Stages run on their own threads and exchange time-stamped packets through
//! queues plus a textual command protocol. The recognizer stage drives a
//! decoder through a five-state control loop and keeps its output in time
//! order with the markers that flow past it.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod app;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod decoder;
pub mod defaults;
pub mod error;
pub mod pipeline;
pub mod recognizer;

// Core traits
pub use decoder::Decoder;
pub use pipeline::error::ErrorReporter;
pub use pipeline::stage::StageHandler;

// Pipeline
pub use pipeline::{CommandPacket, Packet, PacketQueue, Stage};
pub use recognizer::{Recognizer, RecognizerSettings, RunMode, RunState};

// Resources
pub use decoder::{MockDecoder, ResourceContext, ResourceGroup};

// Error handling
pub use error::{ErrorCode, PipelineError, Result};

// Config
pub use config::Config;

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
