//! CLI entry point for hevconv
//!
//! Parses command line arguments, queues the given files, and drives
//! the encoder until the queue drains.

use clap::Parser;
use hevconv::{Encoder, EncoderEvent, JobEvent};
use hevconv_config::{Config, EncodeOptions};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// hevconv - batch H.265/HEVC transcoder driving ffmpeg
#[derive(Parser, Debug)]
#[command(name = "hevconv")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Files to encode, processed in the order given
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// CRF value for constant-quality encoding
    #[arg(short, long)]
    quality: Option<u8>,

    /// Target video bitrate in kbps (selects bitrate mode)
    #[arg(short = 'b', long)]
    video_bitrate: Option<u32>,

    /// x265 speed preset
    #[arg(short, long)]
    preset: Option<String>,

    /// Directory encoded output is written to
    #[arg(short, long)]
    destination: Option<PathBuf>,

    /// Container extension for produced files
    #[arg(short = 'f', long)]
    output_format: Option<String>,

    /// Normalization aggressiveness, 0-5
    #[arg(short, long)]
    normalize_level: Option<u8>,

    /// Language used to pick default audio/subtitle tracks
    #[arg(long)]
    native_language: Option<String>,

    /// Colon-separated named presets to expand
    #[arg(long)]
    as_preset: Option<String>,

    /// Output bit depth override
    #[arg(long)]
    bitdepth: Option<u8>,

    /// Scale output to this height, preserving aspect ratio
    #[arg(long)]
    scale: Option<u32>,

    /// Extra x265 parameters appended verbatim
    #[arg(long)]
    extra_options: Option<String>,

    /// Number of bitrate-controlled encode passes
    #[arg(long)]
    multi_pass: Option<u32>,

    /// Encode only a short window from the source midpoint
    #[arg(long)]
    preview: bool,

    /// Length of the preview/sample window in milliseconds
    #[arg(long)]
    preview_length: Option<u64>,

    /// Re-encode sources already in the target codec
    #[arg(long = "override")]
    override_encode: bool,

    /// Replace each source file with its encoded output
    #[arg(long)]
    delete_source: bool,

    /// Produce six stills from each encoded output
    #[arg(long)]
    screenshots: bool,

    /// Extract a short stream-copy sample clip per encode
    #[arg(long)]
    sample: bool,

    /// Append a CSV stats row per finished encode
    #[arg(long)]
    stats: bool,

    /// Path of the stats CSV file
    #[arg(long)]
    stats_file: Option<PathBuf>,

    /// Dry run; stop each job just before the encode starts
    #[arg(long)]
    test: bool,

    /// Re-encode non-lossless audio to low-bitrate Opus
    #[arg(long)]
    he_audio: bool,

    /// Apply high-efficiency audio even to lossless streams
    #[arg(long)]
    force_he_audio: bool,

    /// Downmix high-efficiency audio to stereo above 3 channels
    #[arg(long)]
    downmix_he_audio: bool,

    /// Force a keyframe interval of one second
    #[arg(long)]
    accurate_timestamps: bool,

    /// Skip bitmap-subtitle upconversion
    #[arg(long)]
    skip_upconvert: bool,
}

impl Args {
    /// Layer command line flags over the loaded configuration.
    fn apply(&self, options: &mut EncodeOptions) {
        macro_rules! set {
            ($field:ident) => {
                if let Some(value) = self.$field.clone() {
                    options.$field = value;
                }
            };
            (opt $field:ident) => {
                if self.$field.is_some() {
                    options.$field = self.$field.clone();
                }
            };
            (flag $field:ident) => {
                if self.$field {
                    options.$field = true;
                }
            };
        }

        set!(quality);
        set!(opt video_bitrate);
        set!(opt preset);
        set!(destination);
        set!(output_format);
        set!(normalize_level);
        set!(opt native_language);
        set!(opt as_preset);
        set!(opt bitdepth);
        set!(opt scale);
        set!(opt extra_options);
        set!(multi_pass);
        set!(flag preview);
        if let Some(ms) = self.preview_length {
            options.preview_length_ms = ms;
        }
        set!(flag override_encode);
        set!(flag delete_source);
        set!(flag screenshots);
        set!(flag sample);
        set!(flag stats);
        set!(stats_file);
        set!(flag test);
        set!(flag he_audio);
        set!(flag force_he_audio);
        set!(flag downmix_he_audio);
        set!(flag accurate_timestamps);
        set!(flag skip_upconvert);
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut options = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config.encoding,
            Err(e) => {
                tracing::error!(config = %path.display(), error = %e, "failed to load configuration");
                return ExitCode::FAILURE;
            }
        },
        None => EncodeOptions::default(),
    };
    args.apply(&mut options);

    let encoder = Encoder::new();
    let Some(mut events) = encoder.take_events() else {
        return ExitCode::FAILURE;
    };

    let mut queued = 0;
    for input in &args.inputs {
        match encoder.enqueue(input.clone(), options.clone()) {
            Ok(_) => queued += 1,
            Err(e) => tracing::error!(input = %input.display(), error = %e, "cannot queue file"),
        }
    }
    if queued == 0 {
        tracing::error!("no valid inputs to encode");
        return ExitCode::FAILURE;
    }

    if let Err(e) = encoder.start() {
        tracing::error!(error = %e, "failed to start the queue");
        return ExitCode::FAILURE;
    }

    while let Some(event) = events.recv().await {
        match event {
            EncoderEvent::Processing { id, name } => {
                tracing::info!(job = id, "processing {name}");
            }
            EncoderEvent::Job(JobEvent::StageChanged { id, stage }) => {
                tracing::debug!(job = id, stage = stage.name(), "stage");
            }
            EncoderEvent::Job(JobEvent::Progress { id, report }) => {
                tracing::info!(
                    job = id,
                    "{:.1}% at {:.0} fps ({:.2}x), eta {}s",
                    report.percent,
                    report.fps,
                    report.speed,
                    report.eta.as_secs()
                );
            }
            EncoderEvent::Job(JobEvent::Finished { id, ratio }) => match ratio {
                Some(ratio) => tracing::info!(job = id, "finished at {ratio:.1}% of original size"),
                None => tracing::info!(job = id, "finished"),
            },
            EncoderEvent::Job(JobEvent::Failed { id, cause, .. }) => {
                tracing::warn!(job = id, "failed: {cause}");
            }
            EncoderEvent::Drained { failed } => {
                let finished = encoder.finished_count();
                tracing::info!(finished, failed = failed.len(), "queue drained");
                for (name, cause) in encoder.failed_summary() {
                    tracing::warn!("{name}: {cause}");
                }
                return if failed.is_empty() {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::FAILURE
                };
            }
            _ => {}
        }
    }

    ExitCode::FAILURE
}
