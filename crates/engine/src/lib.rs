//! Batch H.265 transcoding engine
//!
//! Drives ffmpeg and friends to convert whole libraries to HEVC: a
//! single-flight FIFO queue admits files, and each job walks a fixed
//! pipeline of analysis, normalization, encode, and verification
//! stages. Pause, resume, and stop reach both the stage sequencer and
//! the live subprocess.

pub mod analysis;
pub mod command;
pub mod context;
pub mod error;
pub mod pipeline;
pub mod probe;
pub mod process;
pub mod progress;
pub mod queue;
pub mod stats;
pub mod streams;
pub mod upconvert;

pub use command::{EncodeCommand, RateControl};
pub use context::JobContext;
pub use error::PipelineError;
pub use pipeline::{Job, JobEvent, JobStatus, Stage};
pub use process::{can_suspend, ProcessError};
pub use progress::ProgressReport;
pub use queue::{Encoder, EncoderEvent, QueueError, QueueState};
