//! Failure kinds the pipeline distinguishes.
//!
//! Everything else travels as a plain `anyhow::Error`; callers that need to tell these kinds
//! apart use `downcast_ref::<PipelineError>()`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The (OS, architecture) pair has no registration-engine bundle.
    #[error("Unsupported platform: {os}-{arch}")]
    UnsupportedPlatform { os: String, arch: String },

    /// A referenced input path does not exist.
    #[error("Input path {} does not exist", .0.display())]
    MissingInputPath(PathBuf),

    /// An external engine exited non-zero, could not be spawned, or produced no output.
    #[error("{tool} failed on {}: {reason}", target.display())]
    ConversionFailure {
        tool: String,
        target: PathBuf,
        reason: String,
    },

    /// A multiplex channel was requested twice or refers to an unusable tracer.
    #[error("Channel assignment conflict: {0}")]
    ChannelAssignmentConflict(String),

    /// Every moving tracer failed to align.
    #[error("No tracer could be aligned to reference {reference}")]
    NoTracersAligned { reference: String },
}

impl PipelineError {
    pub fn conversion(tool: &str, target: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        PipelineError::ConversionFailure {
            tool: tool.to_string(),
            target: target.into(),
            reason: reason.into(),
        }
    }
}
