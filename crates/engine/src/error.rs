//! Job failure taxonomy
//!
//! Every way a job can stop short of a finished encode, used both as the
//! stage return error and as the cause recorded on a failed job.

use std::path::PathBuf;

use thiserror::Error;

use crate::probe::ProbeError;
use crate::process::ProcessError;
use hevconv_config::PresetError;

/// Error type for pipeline stage execution
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The computed output path already exists on disk
    #[error("Output {0:?} already exists")]
    OutputAlreadyExists(PathBuf),

    /// The source video stream is already in the target codec
    #[error("Video is already encoded in the target codec")]
    AlreadyEncoded,

    /// The source contains nothing to encode
    #[error("Source contains no video stream")]
    NoVideoStream,

    /// Named preset resolution failed
    #[error(transparent)]
    Preset(#[from] PresetError),

    /// A required ffmpeg filter is not compiled into the local build
    #[error("Filter {0:?} is not available in this ffmpeg build")]
    FilterUnavailable(String),

    /// The requested feature is recognized but not supported
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    /// Source metadata probing failed
    #[error(transparent)]
    Probe(#[from] ProbeError),

    /// An external tool failed or went missing
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// The encode subprocess died to an explicit kill
    #[error("Encoding was killed before it finished")]
    Killed,

    /// The encode subprocess exited with a failure status
    #[error("Encoding failed: {0}")]
    EncodeFailed(String),

    /// Output duration diverged from the source by more than the tolerance
    #[error("Output duration differs from source by {0:.2}s")]
    DurationMismatch(f64),

    /// Multi-pass encoding requires a target bitrate
    #[error("Multi-pass encoding is incompatible with constant-quality mode")]
    IncompatibleWithConstantQuality,

    /// Test mode reached the encode stage and stopped as designed
    #[error("Test mode: refusing to start the encode")]
    TestModeSkip,

    /// The job was stopped before it could finish
    #[error("Job was stopped prematurely")]
    StoppedPrematurely,

    /// Filesystem operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Short machine-readable label for events and stats.
    pub fn label(&self) -> &'static str {
        match self {
            Self::OutputAlreadyExists(_) => "output-already-exists",
            Self::AlreadyEncoded => "already-encoded",
            Self::NoVideoStream => "no-video-stream",
            Self::Preset(PresetError::UnknownPreset(_)) => "unknown-preset",
            Self::Preset(PresetError::UnknownPresetOption { .. }) => "unknown-preset-option",
            Self::FilterUnavailable(_) => "filter-unavailable",
            Self::NotImplemented(_) => "not-implemented",
            Self::Probe(_) => "probe-failed",
            Self::Process(ProcessError::ToolMissing(_)) => "tool-missing",
            Self::Process(ProcessError::Killed) | Self::Killed => "killed",
            Self::Process(_) => "tool-failed",
            Self::EncodeFailed(_) => "encode-failed",
            Self::DurationMismatch(_) => "duration-mismatch",
            Self::IncompatibleWithConstantQuality => "constant-quality-multipass",
            Self::TestModeSkip => "test-mode",
            Self::StoppedPrematurely => "stopped",
            Self::Io(_) => "io",
        }
    }
}
