//! Job pipeline
//!
//! A job walks one source file through a fixed sequence of stages:
//! filesystem checks, probing, stream classification, analysis and
//! normalization passes, the encode itself (optionally multi-pass),
//! verification, and post-processing. Stage boundaries double as
//! pause/stop checkpoints, and every temporary artifact a stage creates
//! is tracked so a job cleans up after itself no matter how it ends.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Local;
use humansize::{format_size, DECIMAL};
use tokio::sync::mpsc;

use hevconv_config::{resolve_as_preset, EncodeOptions};

use crate::analysis::{self, crop, interlace, loudness};
use crate::command::{EncodeCommand, RateControl};
use crate::context::JobContext;
use crate::error::PipelineError;
use crate::probe::{self, Metadata};
use crate::process::{CommandSpec, ProcessError, ToolProcess};
use crate::progress::{self, ProgressReport};
use crate::stats;
use crate::streams::{self, ClassifiedStream, ClassifiedStreams};
use crate::upconvert;

/// Tolerated difference between source and output duration.
const DURATION_TOLERANCE_SECS: f64 = 1.0;
/// Stills produced by the screenshots stage.
const SCREENSHOT_COUNT: u32 = 6;

/// The fixed stage sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Filesystem,
    Metadata,
    ClassifyStreams,
    ApplyPreset,
    Upconvert,
    BitDepth,
    NormalizeAudio,
    AutoCrop,
    Deinterlace,
    MapStreams,
    HeAudio,
    Encode,
    MultiPass,
    Verify,
    Relocate,
    Screenshots,
    Sample,
    Stats,
}

impl Stage {
    pub const ALL: [Stage; 18] = [
        Stage::Filesystem,
        Stage::Metadata,
        Stage::ClassifyStreams,
        Stage::ApplyPreset,
        Stage::Upconvert,
        Stage::BitDepth,
        Stage::NormalizeAudio,
        Stage::AutoCrop,
        Stage::Deinterlace,
        Stage::MapStreams,
        Stage::HeAudio,
        Stage::Encode,
        Stage::MultiPass,
        Stage::Verify,
        Stage::Relocate,
        Stage::Screenshots,
        Stage::Sample,
        Stage::Stats,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Filesystem => "filesystem",
            Stage::Metadata => "metadata",
            Stage::ClassifyStreams => "classify-streams",
            Stage::ApplyPreset => "apply-preset",
            Stage::Upconvert => "upconvert",
            Stage::BitDepth => "bit-depth",
            Stage::NormalizeAudio => "normalize-audio",
            Stage::AutoCrop => "auto-crop",
            Stage::Deinterlace => "deinterlace",
            Stage::MapStreams => "map-streams",
            Stage::HeAudio => "he-audio",
            Stage::Encode => "encode",
            Stage::MultiPass => "multi-pass",
            Stage::Verify => "verify",
            Stage::Relocate => "relocate",
            Stage::Screenshots => "screenshots",
            Stage::Sample => "sample",
            Stage::Stats => "stats",
        }
    }
}

/// Lifecycle state of a job.
///
/// Pause and stop are control-plane conditions observed through events;
/// the persisted status only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Finished,
    Failed,
}

/// Events a running job emits for its scheduler and observers.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Started { id: u64 },
    StageChanged { id: u64, stage: Stage },
    Progress { id: u64, report: ProgressReport },
    Finished { id: u64, ratio: Option<f64> },
    Failed { id: u64, cause: String, label: &'static str },
}

pub type EventSink = mpsc::UnboundedSender<JobEvent>;

/// Paths a job writes to, derived once at admission.
#[derive(Debug, Clone)]
pub struct OutputPaths {
    /// Destination directory
    pub dir: PathBuf,
    /// Output file name, `<stem>.<format>`
    pub base: String,
    /// Full output path; relocation may move it next to the source
    pub path: PathBuf,
    /// Sample clip path
    pub sample: PathBuf,
}

impl OutputPaths {
    pub fn derive(source: &Path, options: &EncodeOptions) -> Self {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        let base = format!("{stem}.{}", options.output_format);
        let dir = options.destination.clone();
        Self {
            path: dir.join(&base),
            sample: dir.join(format!("{stem}-sample.{}", options.output_format)),
            base,
            dir,
        }
    }
}

/// One queued encode.
pub struct Job {
    pub id: u64,
    /// Original source file
    pub source: PathBuf,
    /// Current encode input; multi-pass shuffles this between passes
    pub path: PathBuf,
    pub options: EncodeOptions,
    pub output: OutputPaths,
    pub status: JobStatus,
    pub stage: Option<Stage>,
    pub error: Option<PipelineError>,
    pub progress: Option<ProgressReport>,
    /// Output size as a percentage of the source, once verified
    pub ratio: Option<f64>,
    pub elapsed: Duration,
    source_size: u64,
    output_size: u64,
    bit_depth: u8,
    interlaced: bool,
    duration: f64,
    frame_rate: f64,
    pass: u32,
    x265_params: Vec<String>,
    temp_files: Vec<PathBuf>,
    started: Option<Instant>,
}

impl Job {
    pub fn new(id: u64, source: PathBuf, options: EncodeOptions) -> Self {
        let output = OutputPaths::derive(&source, &options);
        Self {
            id,
            path: source.clone(),
            source,
            options,
            output,
            status: JobStatus::Pending,
            stage: None,
            error: None,
            progress: None,
            ratio: None,
            elapsed: Duration::ZERO,
            source_size: 0,
            output_size: 0,
            bit_depth: 8,
            interlaced: false,
            duration: 0.0,
            frame_rate: 0.0,
            pass: 0,
            x265_params: Vec::new(),
            temp_files: Vec::new(),
            started: None,
        }
    }

    pub fn display_name(&self) -> String {
        self.source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.source.display().to_string())
    }

    pub fn is_interlaced(&self) -> bool {
        self.interlaced
    }

    pub fn bit_depth(&self) -> u8 {
        self.bit_depth
    }

    /// Drive the job to a terminal status.
    pub(crate) async fn run(
        &mut self,
        ctx: &JobContext,
        events: &EventSink,
        watch_ignore: &std::sync::Arc<std::sync::Mutex<Vec<PathBuf>>>,
    ) {
        self.status = JobStatus::Running;
        self.started = Some(Instant::now());
        let _ = events.send(JobEvent::Started { id: self.id });
        tracing::info!(job = self.id, source = %self.source.display(), "job started");

        let result = self.run_stages(ctx, events, watch_ignore).await;
        self.elapsed = self.started.map(|s| s.elapsed()).unwrap_or_default();
        self.clean_up();

        match result {
            Ok(()) => {
                self.status = JobStatus::Finished;
                tracing::info!(
                    job = self.id,
                    elapsed = %progress::format_hms(self.elapsed.as_secs_f64()),
                    "job finished"
                );
                let _ = events.send(JobEvent::Finished {
                    id: self.id,
                    ratio: self.ratio,
                });
            }
            Err(error) => {
                // a kill that raced some other failure still reads as a stop
                let error = if ctx.is_stopped() {
                    PipelineError::StoppedPrematurely
                } else {
                    error
                };
                tracing::warn!(job = self.id, error = %error, "job failed");
                let _ = events.send(JobEvent::Failed {
                    id: self.id,
                    cause: error.to_string(),
                    label: error.label(),
                });
                self.error = Some(error);
                self.status = JobStatus::Failed;
            }
        }
    }

    async fn enter(
        &mut self,
        stage: Stage,
        ctx: &JobContext,
        events: &EventSink,
    ) -> Result<(), PipelineError> {
        ctx.checkpoint().await?;
        self.stage = Some(stage);
        tracing::debug!(job = self.id, stage = stage.name(), "entering stage");
        let _ = events.send(JobEvent::StageChanged {
            id: self.id,
            stage,
        });
        Ok(())
    }

    async fn run_stages(
        &mut self,
        ctx: &JobContext,
        events: &EventSink,
        watch_ignore: &std::sync::Arc<std::sync::Mutex<Vec<PathBuf>>>,
    ) -> Result<(), PipelineError> {
        let mut cmd = seed_command(&self.path);

        self.enter(Stage::Filesystem, ctx, events).await?;
        self.check_output_collision()?;

        self.enter(Stage::Metadata, ctx, events).await?;
        let metadata = self.probe_source(ctx).await?;

        self.enter(Stage::ClassifyStreams, ctx, events).await?;
        let (mut streams, video) = self.classify_streams(&metadata, &mut cmd)?;

        self.enter(Stage::ApplyPreset, ctx, events).await?;
        cmd = self.apply_named_presets(cmd)?;

        self.enter(Stage::Upconvert, ctx, events).await?;
        cmd = self.upconvert_subtitles(ctx, &mut streams, cmd).await?;

        self.enter(Stage::BitDepth, ctx, events).await?;
        self.bit_depth = match self.options.bitdepth {
            Some(depth) => clamp_bit_depth(depth),
            None => detect_bit_depth(video.info.pix_fmt.as_deref()),
        };
        cmd = cmd.pix_fmt(pix_fmt_for_depth(self.bit_depth));

        self.enter(Stage::NormalizeAudio, ctx, events).await?;
        cmd = self.normalize_audio(ctx, &streams, cmd).await?;

        self.enter(Stage::AutoCrop, ctx, events).await?;
        cmd = self.auto_crop(ctx, &video, cmd).await?;

        self.enter(Stage::Deinterlace, ctx, events).await?;
        if self.options.normalize_level >= 3 && interlace::detect(ctx, &self.path).await? {
            tracing::info!(job = self.id, "source is interlaced; deinterlacing");
            self.interlaced = true;
            cmd = cmd.video_filter("yadif");
        }

        self.enter(Stage::MapStreams, ctx, events).await?;
        cmd = self.map_streams(&streams, &video, cmd);

        self.enter(Stage::HeAudio, ctx, events).await?;
        cmd = self.high_efficiency_audio(&streams, cmd);

        self.enter(Stage::Encode, ctx, events).await?;
        if self.options.test {
            return Err(PipelineError::TestModeSkip);
        }
        tokio::fs::create_dir_all(&self.output.dir).await?;
        if self.options.accurate_timestamps && self.frame_rate > 0.0 {
            self.x265_params
                .push(format!("keyint={}", self.frame_rate.round() as u32));
        }
        if let Some(extra) = self.options.extra_options.clone() {
            self.x265_params.push(extra);
        }
        if let Some(height) = self.options.scale {
            cmd = cmd.video_filter(format!("scale=-1:{height}"));
        }
        let encode_cmd = self.finish_command(cmd);
        self.pass += 1;
        self.run_encode(ctx, events, encode_cmd).await?;

        self.enter(Stage::MultiPass, ctx, events).await?;
        self.remaining_passes(ctx, events).await?;

        self.enter(Stage::Verify, ctx, events).await?;
        self.verify_output(&metadata).await?;

        self.enter(Stage::Relocate, ctx, events).await?;
        self.relocate_output(watch_ignore).await?;

        self.enter(Stage::Screenshots, ctx, events).await?;
        self.take_screenshots(ctx).await?;

        self.enter(Stage::Sample, ctx, events).await?;
        self.extract_sample(ctx).await?;

        self.enter(Stage::Stats, ctx, events).await?;
        self.append_stats()?;

        Ok(())
    }

    fn check_output_collision(&self) -> Result<(), PipelineError> {
        if self.output.path.exists() {
            return Err(PipelineError::OutputAlreadyExists(self.output.path.clone()));
        }
        Ok(())
    }

    /// Probe the source, recovering a duration with a discard decode
    /// when the container does not report one. Subtitle-only sources
    /// legitimately have no duration and are left alone.
    async fn probe_source(&mut self, ctx: &JobContext) -> Result<Metadata, PipelineError> {
        let mut metadata = probe::probe(&self.path).await?;
        if metadata.format.duration.is_none()
            && metadata.format.format_name.as_deref() != Some("srt")
        {
            tracing::debug!(job = self.id, "container reports no duration; decoding to recover it");
            let null_pass = EncodeCommand::new(&self.path).discard_output();
            let lines = ctx
                .run_collect(&CommandSpec::ffmpeg(null_pass.build()))
                .await?;
            metadata.format.duration = progress::last_timemark_secs(&lines);
        }
        self.duration = metadata.format.duration.unwrap_or(0.0);
        self.source_size = metadata.format.size.unwrap_or(0);
        Ok(metadata)
    }

    fn classify_streams(
        &mut self,
        metadata: &Metadata,
        cmd: &mut EncodeCommand,
    ) -> Result<(ClassifiedStreams, ClassifiedStream), PipelineError> {
        let streams = streams::classify(&metadata.streams);
        let Some(video) = streams.video.first().cloned() else {
            return Err(PipelineError::NoVideoStream);
        };
        if streams.video.len() > 1 {
            tracing::warn!(
                job = self.id,
                count = streams.video.len(),
                "multiple video streams; encoding the first"
            );
        }
        if video.info.codec_name.as_deref() == Some("hevc") && !self.options.override_encode {
            return Err(PipelineError::AlreadyEncoded);
        }
        self.frame_rate = video.info.frame_rate().unwrap_or(0.0);

        if self.options.preview {
            *cmd = cmd
                .clone()
                .window(self.duration / 2.0, self.options.preview_length_secs());
        }
        if self.options.multi_pass > 1 {
            self.x265_params
                .push(format!("pass=1:stats={}", stats_log().display()));
        }
        Ok((streams, video))
    }

    fn apply_named_presets(&mut self, mut cmd: EncodeCommand) -> Result<EncodeCommand, PipelineError> {
        let Some(spec) = self.options.as_preset.clone() else {
            return Ok(cmd);
        };
        let resolved = resolve_as_preset(&spec)?;
        self.x265_params.extend(resolved.x265_params);
        for filter in resolved.video_filters {
            cmd = cmd.video_filter(filter);
        }
        // explicit settings beat preset-supplied ones
        if self.options.preset.is_none() {
            self.options.preset = resolved.preset;
        }
        if self.options.bitdepth.is_none() {
            self.options.bitdepth = resolved.bitdepth;
        }
        Ok(cmd)
    }

    /// OCR bitmap DVD subtitles into SubRip tracks appended as extra
    /// inputs; the classified entry is swapped for the new text track.
    async fn upconvert_subtitles(
        &mut self,
        ctx: &JobContext,
        streams: &mut ClassifiedStreams,
        mut cmd: EncodeCommand,
    ) -> Result<EncodeCommand, PipelineError> {
        if self.options.skip_upconvert || self.options.test {
            return Ok(cmd);
        }
        for subtitle in streams.subtitle.iter_mut() {
            if !matches!(
                subtitle.info.codec_name.as_deref(),
                Some("dvd_subtitle" | "dvdsub")
            ) {
                continue;
            }
            ctx.checkpoint().await?;
            tracing::info!(
                job = self.id,
                track = subtitle.info.index,
                "upconverting bitmap subtitle"
            );
            let stem = upconvert::extract_track(ctx, &self.source, subtitle.info.index).await?;
            self.temp_files.extend(upconvert::artifact_paths(&stem));
            let srt = upconvert::vobsub_to_srt(ctx, &stem).await?;

            let srt_meta = probe::probe(&srt).await?;
            let Some(mut info) = srt_meta.streams.into_iter().next() else {
                tracing::warn!(
                    job = self.id,
                    track = subtitle.info.index,
                    "upconversion produced an empty subtitle; keeping the bitmap track"
                );
                continue;
            };
            // the OCR output has no identity; carry it over
            info.tags = subtitle.info.tags.clone();
            info.disposition = subtitle.info.disposition.clone();

            let (extended, ordinal) = cmd.add_input(&srt);
            cmd = extended;
            *subtitle = ClassifiedStream {
                input: ordinal,
                info,
            };
        }
        Ok(cmd)
    }

    async fn normalize_audio(
        &mut self,
        ctx: &JobContext,
        streams: &ClassifiedStreams,
        mut cmd: EncodeCommand,
    ) -> Result<EncodeCommand, PipelineError> {
        if self.options.normalize_level < 3 || streams.audio.is_empty() {
            return Ok(cmd);
        }
        let filters = analysis::available_filters().await?;
        let window = self
            .options
            .preview
            .then(|| (self.duration / 2.0, self.options.preview_length_secs()));

        if self.options.normalize_level >= 5 {
            if !filters.contains("dynaudnorm") {
                return Err(PipelineError::FilterUnavailable("dynaudnorm".to_string()));
            }
            return Err(PipelineError::NotImplemented("dynamic audio normalization"));
        }

        if self.options.normalize_level >= 4 {
            if !filters.contains("loudnorm") {
                return Err(PipelineError::FilterUnavailable("loudnorm".to_string()));
            }
            match loudness::measure_loudnorm(ctx, &self.path, &streams.audio, window).await? {
                Some(measured) => {
                    tracing::info!(job = self.id, input_i = %measured.input_i, "applying loudness normalization");
                    cmd = cmd.audio_filter(measured.second_pass_filter());
                }
                None => {
                    tracing::warn!(job = self.id, "loudnorm printed no measurement block; skipping")
                }
            }
            return Ok(cmd);
        }

        if !filters.contains("volumedetect") {
            return Err(PipelineError::FilterUnavailable("volumedetect".to_string()));
        }
        let peaks = loudness::measure_peaks(ctx, &self.path, &streams.audio, window).await?;
        for (ordinal, (stream, peak)) in streams.audio.iter().zip(&peaks).enumerate() {
            let gain = loudness::peak_gain_db(*peak);
            let channels = stream.info.channels.unwrap_or(2);
            tracing::info!(job = self.id, stream = %stream.map_spec(), gain, "applying peak normalization");
            cmd = cmd
                .arg_pair(
                    "-filter_complex",
                    format!("[{}]volume={gain:.1}dB", stream.map_spec()),
                )
                .arg_pair(format!("-c:a:{ordinal}"), "aac")
                .arg_pair(format!("-b:a:{ordinal}"), format!("{}k", 128 * channels));
        }
        Ok(cmd)
    }

    async fn auto_crop(
        &mut self,
        ctx: &JobContext,
        video: &ClassifiedStream,
        mut cmd: EncodeCommand,
    ) -> Result<EncodeCommand, PipelineError> {
        if self.options.normalize_level < 1 {
            return Ok(cmd);
        }
        if let Some(rect) = crop::detect(ctx, &self.path, &video.map_spec(), self.duration).await? {
            let native_width = video.info.width.unwrap_or(0);
            let native_height = video.info.height.unwrap_or(0);
            if rect.crops(native_width, native_height) {
                tracing::info!(job = self.id, filter = %rect.filter(), "cropping black bars");
                cmd = cmd.video_filter(rect.filter());
            }
        }
        Ok(cmd)
    }

    fn map_streams(
        &mut self,
        streams: &ClassifiedStreams,
        video: &ClassifiedStream,
        mut cmd: EncodeCommand,
    ) -> EncodeCommand {
        cmd = cmd.map(video.map_spec());

        let native = self.options.native_language.as_deref();
        let default_audio = native.and_then(|lang| streams::default_audio(&streams.audio, lang));
        for (ordinal, stream) in streams.audio.iter().enumerate() {
            cmd = cmd.map(stream.map_spec());
            if self.options.normalize_level >= 2 && stream.info.title().is_none() {
                cmd = cmd.arg_pair(
                    format!("-metadata:s:a:{ordinal}"),
                    format!("title={}", streams::audio_title(&stream.info)),
                );
            }
            if Some(ordinal) == default_audio {
                cmd = cmd.arg_pair(format!("-disposition:a:{ordinal}"), "default");
            }
        }

        // subtitles only carry the default flag when no audio matched
        let default_subtitle = if default_audio.is_none() {
            native.and_then(|lang| streams::default_subtitle(&streams.subtitle, lang))
        } else {
            None
        };
        for (ordinal, stream) in streams.subtitle.iter().enumerate() {
            cmd = cmd.map(stream.map_spec());
            if self.options.normalize_level >= 2 && stream.info.title().is_none() {
                cmd = cmd.arg_pair(
                    format!("-metadata:s:s:{ordinal}"),
                    format!("title={}", streams::subtitle_title(&stream.info)),
                );
            }
            if Some(ordinal) == default_subtitle {
                cmd = cmd.arg_pair(format!("-disposition:s:{ordinal}"), "default");
            }
        }

        for stream in &streams.other {
            cmd = cmd.map(stream.map_spec());
        }
        cmd
    }

    fn high_efficiency_audio(
        &mut self,
        streams: &ClassifiedStreams,
        mut cmd: EncodeCommand,
    ) -> EncodeCommand {
        if !(self.options.he_audio || self.options.force_he_audio) {
            return cmd;
        }
        let mut converted = false;
        for (ordinal, stream) in streams.audio.iter().enumerate() {
            let lossless = stream.info.codec_name.as_deref() == Some("flac");
            if lossless && !self.options.force_he_audio {
                tracing::debug!(job = self.id, stream = %stream.map_spec(), "leaving lossless audio alone");
                continue;
            }
            converted = true;
            let mut channels = stream.info.channels.unwrap_or(2);
            cmd = cmd.arg_pair(format!("-c:a:{ordinal}"), "libopus");
            if self.options.downmix_he_audio && channels > 3 {
                cmd = cmd
                    .arg_pair(format!("-ac:a:{ordinal}"), "2")
                    .audio_filter("aresample=matrix_encoding=dplii");
                channels = 2;
            }
            cmd = cmd.arg_pair(
                format!("-b:a:{ordinal}"),
                format!("{}k", self.options.he_audio_bitrate * channels),
            );
            // a title synthesized at map time names the source codec;
            // replace it for tracks that are no longer in that codec
            if self.options.normalize_level >= 2 && stream.info.title().is_none() {
                cmd = cmd.arg_pair(
                    format!("-metadata:s:a:{ordinal}"),
                    format!(
                        "title={}",
                        streams::reencoded_audio_title(&stream.info, "OPUS", channels)
                    ),
                );
            }
        }
        if converted {
            cmd = cmd
                .audio_filter("aformat=channel_layouts=7.1|5.1|stereo")
                .arg_pair("-frame_duration", "60");
        }
        cmd
    }

    /// Attach rate control, speed preset, accumulated x265 parameters,
    /// and the output path. Shared between the first encode and the
    /// rebuilt commands of later passes.
    fn finish_command(&self, mut cmd: EncodeCommand) -> EncodeCommand {
        cmd = cmd.rate(match self.options.video_bitrate {
            Some(kbps) => RateControl::Bitrate(kbps),
            None => RateControl::ConstantQuality(self.options.quality),
        });
        if let Some(preset) = &self.options.preset {
            cmd = cmd.preset(preset);
        }
        cmd.x265_params(self.x265_params.iter().cloned())
            .output_file(&self.output.path)
    }

    /// Run one encode to completion, streaming progress. The output is
    /// treated as a temporary artifact until the tool exits cleanly.
    async fn run_encode(
        &mut self,
        ctx: &JobContext,
        events: &EventSink,
        cmd: EncodeCommand,
    ) -> Result<(), PipelineError> {
        self.temp_files.push(self.output.path.clone());
        let spec = CommandSpec::ffmpeg(cmd.build());
        tracing::info!(
            job = self.id,
            pass = self.pass,
            command = %spec.command_line(),
            "starting encode"
        );

        let started = Instant::now();
        let mut proc = ToolProcess::spawn(&spec)?;
        ctx.register(&proc);
        while let Some(line) = proc.next_line().await {
            if let Some(raw) = progress::parse_status_line(&line) {
                let written = std::fs::metadata(&self.output.path).ok().map(|m| m.len());
                let report = ProgressReport::derive(
                    &raw,
                    self.duration,
                    self.frame_rate,
                    started.elapsed(),
                    written,
                );
                self.progress = Some(report.clone());
                let _ = events.send(JobEvent::Progress {
                    id: self.id,
                    report,
                });
            }
        }
        let result = proc.wait().await;
        ctx.clear_active();

        match result {
            Ok(_) => {
                self.temp_files.retain(|p| p != &self.output.path);
                Ok(())
            }
            Err(ProcessError::Killed) => Err(PipelineError::Killed),
            Err(ProcessError::NonZeroExit { detail, .. }) => {
                Err(PipelineError::EncodeFailed(detail))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Passes two and up: the previous output moves aside and becomes
    /// the input of a rebuilt copy-remux command that re-encodes only
    /// the video stream, now steered by the x265 stats file.
    async fn remaining_passes(
        &mut self,
        ctx: &JobContext,
        events: &EventSink,
    ) -> Result<(), PipelineError> {
        if self.options.multi_pass <= 1 {
            return Ok(());
        }
        if !self.options.bitrate_mode() {
            return Err(PipelineError::IncompatibleWithConstantQuality);
        }
        while self.pass < self.options.multi_pass {
            ctx.checkpoint().await?;

            let pass_input = pass_input_path(&self.output.path, self.pass);
            tokio::fs::rename(&self.output.path, &pass_input).await?;
            self.path = pass_input.clone();
            self.temp_files.push(pass_input.clone());
            self.temp_files.push(stats_log());

            self.x265_params
                .push(pass_control_param(self.pass + 1, self.options.multi_pass));
            self.pass += 1;

            // bit depth can shift between passes; re-read it from the
            // intermediate output
            let meta = probe::probe(&pass_input).await?;
            let pix_fmt = meta
                .streams
                .iter()
                .find(|s| s.codec_type.as_deref() == Some("video"))
                .and_then(|s| s.pix_fmt.as_deref());
            self.bit_depth = detect_bit_depth(pix_fmt);

            let cmd = self.finish_command(pass_base_command(&pass_input, self.bit_depth));
            self.run_encode(ctx, events, cmd).await?;
        }
        Ok(())
    }

    /// Compare output duration against the source; a divergence beyond
    /// the tolerance means a truncated or runaway encode, and the bad
    /// output is deleted on the spot. Previews are exempt.
    async fn verify_output(&mut self, source_meta: &Metadata) -> Result<(), PipelineError> {
        let out_meta = probe::probe(&self.output.path).await?;
        self.output_size = out_meta.format.size.unwrap_or(0);
        if self.source_size > 0 {
            self.ratio = Some(self.output_size as f64 / self.source_size as f64 * 100.0);
        }
        if self.options.preview {
            return Ok(());
        }
        let source_duration = source_meta.format.duration.unwrap_or(self.duration);
        let delta = source_duration - out_meta.format.duration.unwrap_or(0.0);
        if delta.abs() > DURATION_TOLERANCE_SECS {
            if let Err(e) = tokio::fs::remove_file(&self.output.path).await {
                tracing::warn!(job = self.id, error = %e, "failed to remove bad output");
            }
            return Err(PipelineError::DurationMismatch(delta));
        }
        Ok(())
    }

    /// Replace the source with the encoded output. The final path is
    /// registered with the watcher ignore list first so a directory
    /// watcher does not re-enqueue our own output.
    async fn relocate_output(
        &mut self,
        watch_ignore: &std::sync::Arc<std::sync::Mutex<Vec<PathBuf>>>,
    ) -> Result<(), PipelineError> {
        if !self.options.delete_source {
            return Ok(());
        }
        let source_dir = self.source.parent().unwrap_or(Path::new("."));
        let final_path = source_dir.join(&self.output.base);
        watch_ignore
            .lock()
            .expect("watch ignore lock")
            .push(final_path.clone());

        tracing::info!(job = self.id, to = %final_path.display(), "replacing source with output");
        tokio::fs::remove_file(&self.source).await?;
        move_file(&self.output.path, &final_path).await?;
        self.output.path = final_path;
        Ok(())
    }

    async fn take_screenshots(&mut self, ctx: &JobContext) -> Result<(), PipelineError> {
        if !self.options.screenshots {
            return Ok(());
        }
        let shots_dir = self.output.dir.join("screenshots");
        tokio::fs::create_dir_all(&shots_dir).await?;
        let step = self.duration / f64::from(SCREENSHOT_COUNT + 1);
        let stem = self.output.base.clone();

        let mut taken = 0;
        for shot in 1..=SCREENSHOT_COUNT {
            ctx.checkpoint().await?;
            let cmd = EncodeCommand::new(&self.output.path)
                .seek(step * f64::from(shot))
                .frames(1)
                .output_file(shots_dir.join(format!("{stem}-{shot}.png")));
            match ctx.run_collect(&CommandSpec::ffmpeg(cmd.build())).await {
                Ok(_) => taken += 1,
                Err(ProcessError::Killed) => return Err(PipelineError::StoppedPrematurely),
                Err(e) => tracing::warn!(job = self.id, shot, error = %e, "screenshot failed"),
            }
        }
        if taken < SCREENSHOT_COUNT {
            tracing::warn!(job = self.id, taken, "produced fewer screenshots than requested");
        }
        Ok(())
    }

    /// Cut a short stream-copy clip from the middle of the output.
    async fn extract_sample(&mut self, ctx: &JobContext) -> Result<(), PipelineError> {
        if !self.options.sample {
            return Ok(());
        }
        if self.options.preview {
            tracing::warn!(job = self.id, "preview output is already short; skipping sample");
            return Ok(());
        }
        let cmd = EncodeCommand::new(&self.output.path)
            .window(self.duration / 2.0, self.options.preview_length_secs())
            .map("0")
            .arg_pair("-c", "copy")
            .output_file(&self.output.sample);
        match ctx.run_collect(&CommandSpec::ffmpeg(cmd.build())).await {
            Ok(_) => Ok(()),
            Err(ProcessError::Killed) => Err(PipelineError::StoppedPrematurely),
            Err(e) => Err(e.into()),
        }
    }

    fn append_stats(&mut self) -> Result<(), PipelineError> {
        if !self.options.stats {
            return Ok(());
        }
        let elapsed = self.started.map(|s| s.elapsed()).unwrap_or_default();
        let row = stats::StatsRow {
            encoded_date: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            relative_path: self.source.display().to_string(),
            original_size: format_size(self.source_size, DECIMAL),
            new_size: format_size(self.output_size, DECIMAL),
            percentage: format!("{:.2}%", self.ratio.unwrap_or(0.0)),
            encode_duration: progress::format_hms(elapsed.as_secs_f64()),
        };
        stats::append_row(&self.options.stats_file, &row)?;
        Ok(())
    }

    /// Remove every tracked temporary artifact. Runs on every terminal
    /// transition, success included.
    fn clean_up(&mut self) {
        for path in self.temp_files.drain(..) {
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::debug!(path = %path.display(), "removed temp artifact"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove temp artifact"),
            }
        }
    }
}

/// Fresh command for a first encode. Data streams have no default
/// ffmpeg encoder, so they must be copied explicitly along with audio
/// and subtitles.
fn seed_command(path: &Path) -> EncodeCommand {
    EncodeCommand::new(path)
        .codec_default("-c:a", "copy")
        .codec_default("-c:s", "copy")
        .codec_default("-c:d", "copy")
        .video_codec("libx265")
}

/// Base command for passes two and up. The blanket copy renders ahead
/// of -c:v, which keeps the video re-encoding while everything else
/// remuxes.
fn pass_base_command(input: &Path, bit_depth: u8) -> EncodeCommand {
    EncodeCommand::new(input)
        .map("0")
        .codec_default("-c", "copy")
        .video_codec("libx265")
        .pix_fmt(pix_fmt_for_depth(bit_depth))
}

/// Where x265 keeps its multi-pass statistics.
fn stats_log() -> PathBuf {
    std::env::temp_dir().join("x265stats.log")
}

/// Input path for the next pass: the previous output, shuffled aside.
fn pass_input_path(output: &Path, completed_passes: u32) -> PathBuf {
    PathBuf::from(format!("{}-pass{completed_passes}", output.display()))
}

/// x265 pass-control parameter for the next pass. The final pass reads
/// the stats file (pass=2); intermediate passes read and update it
/// (pass=3).
fn pass_control_param(next_pass: u32, total_passes: u32) -> String {
    let mode = if next_pass == total_passes { 2 } else { 3 };
    format!("pass={mode}:stats={}", stats_log().display())
}

/// Output bit depth detected from the source pixel format.
fn detect_bit_depth(pix_fmt: Option<&str>) -> u8 {
    let Some(pix_fmt) = pix_fmt else { return 8 };
    if pix_fmt.contains("16le") || pix_fmt.contains("16be") {
        16
    } else if pix_fmt.contains("12le") || pix_fmt.contains("12be") {
        12
    } else if pix_fmt.contains("10le") || pix_fmt.contains("10be") {
        10
    } else {
        8
    }
}

/// Clamp a requested bit depth down to the nearest supported tier.
fn clamp_bit_depth(requested: u8) -> u8 {
    match requested {
        0..=9 => 8,
        10..=11 => 10,
        12..=15 => 12,
        _ => 16,
    }
}

fn pix_fmt_for_depth(depth: u8) -> &'static str {
    match depth {
        16 => "yuv420p16le",
        12 => "yuv420p12le",
        10 => "yuv420p10le",
        _ => "yuv420p",
    }
}

async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        // rename fails across filesystems
        Err(_) => {
            tokio::fs::copy(from, to).await?;
            tokio::fs::remove_file(from).await
        }
    }
}
