//! Encode command assembly
//!
//! An `EncodeCommand` accumulates the pieces each pipeline stage
//! contributes (inputs, maps, filters, rate control, x265 parameters)
//! and renders them into one ffmpeg argument vector at spawn time.
//! Stages take the builder by value and hand back the extended copy, so
//! a stage that fails cannot leave a half-applied command behind.

use std::path::{Path, PathBuf};

/// Rate-control selection; exactly one mode is ever rendered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateControl {
    /// CRF constant quality
    ConstantQuality(u8),
    /// Target bitrate in kbps
    Bitrate(u32),
}

/// Where the rendered command writes.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputTarget {
    File(PathBuf),
    /// Null muxer; analysis passes that only want stderr.
    Discard,
}

/// Accumulating ffmpeg command description
#[derive(Debug, Clone)]
pub struct EncodeCommand {
    inputs: Vec<PathBuf>,
    seek: Option<f64>,
    limit: Option<f64>,
    video_codec: Option<String>,
    rate: Option<RateControl>,
    preset: Option<String>,
    pix_fmt: Option<String>,
    frames: Option<u32>,
    maps: Vec<String>,
    codec_defaults: Vec<String>,
    video_filters: Vec<String>,
    audio_filters: Vec<String>,
    x265_params: Vec<String>,
    extra_args: Vec<String>,
    output: OutputTarget,
}

impl EncodeCommand {
    pub fn new<P: AsRef<Path>>(input: P) -> Self {
        Self {
            inputs: vec![input.as_ref().to_path_buf()],
            seek: None,
            limit: None,
            video_codec: None,
            rate: None,
            preset: None,
            pix_fmt: None,
            frames: None,
            maps: Vec::new(),
            codec_defaults: Vec::new(),
            video_filters: Vec::new(),
            audio_filters: Vec::new(),
            x265_params: Vec::new(),
            extra_args: Vec::new(),
            output: OutputTarget::Discard,
        }
    }

    /// Append a secondary input, returning its input ordinal.
    pub fn add_input<P: AsRef<Path>>(mut self, input: P) -> (Self, u32) {
        self.inputs.push(input.as_ref().to_path_buf());
        let ordinal = (self.inputs.len() - 1) as u32;
        (self, ordinal)
    }

    /// Seek into the first input and cap the encoded length.
    pub fn window(mut self, seek_secs: f64, length_secs: f64) -> Self {
        self.seek = Some(seek_secs);
        self.limit = Some(length_secs);
        self
    }

    /// Seek into the first input without capping the length.
    pub fn seek(mut self, seek_secs: f64) -> Self {
        self.seek = Some(seek_secs);
        self
    }

    pub fn video_codec<S: Into<String>>(mut self, codec: S) -> Self {
        self.video_codec = Some(codec.into());
        self
    }

    pub fn rate(mut self, rate: RateControl) -> Self {
        self.rate = Some(rate);
        self
    }

    pub fn preset<S: Into<String>>(mut self, preset: S) -> Self {
        self.preset = Some(preset.into());
        self
    }

    pub fn pix_fmt<S: Into<String>>(mut self, pix_fmt: S) -> Self {
        self.pix_fmt = Some(pix_fmt.into());
        self
    }

    pub fn frames(mut self, frames: u32) -> Self {
        self.frames = Some(frames);
        self
    }

    pub fn map<S: Into<String>>(mut self, spec: S) -> Self {
        self.maps.push(spec.into());
        self
    }

    pub fn video_filter<S: Into<String>>(mut self, filter: S) -> Self {
        self.video_filters.push(filter.into());
        self
    }

    pub fn audio_filter<S: Into<String>>(mut self, filter: S) -> Self {
        self.audio_filters.push(filter.into());
        self
    }

    pub fn x265_param<S: Into<String>>(mut self, param: S) -> Self {
        self.x265_params.push(param.into());
        self
    }

    pub fn x265_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.x265_params.extend(params.into_iter().map(Into::into));
        self
    }

    /// Append a blanket codec selection rendered before the structured
    /// video codec, so the more specific `-c:v` and any per-stream
    /// codec options still win under ffmpeg's last-match rule.
    pub fn codec_default<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.codec_defaults.push(key.into());
        self.codec_defaults.push(value.into());
        self
    }

    /// Append a flag-value pair verbatim after the structured options.
    pub fn arg_pair<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.extra_args.push(key.into());
        self.extra_args.push(value.into());
        self
    }

    pub fn output_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.output = OutputTarget::File(path.as_ref().to_path_buf());
        self
    }

    pub fn discard_output(mut self) -> Self {
        self.output = OutputTarget::Discard;
        self
    }

    pub fn has_video_filters(&self) -> bool {
        !self.video_filters.is_empty()
    }

    /// Joined x265 parameter string as it will be rendered, if any.
    pub fn x265_param_string(&self) -> Option<String> {
        if self.x265_params.is_empty() {
            None
        } else {
            Some(self.x265_params.join(":"))
        }
    }

    /// Render the full ffmpeg argument vector.
    pub fn build(&self) -> Vec<String> {
        let mut args: Vec<String> = vec!["-y".to_string()];

        for (ordinal, input) in self.inputs.iter().enumerate() {
            if ordinal == 0 {
                if let Some(seek) = self.seek {
                    args.push("-ss".to_string());
                    args.push(format!("{seek:.3}"));
                }
            }
            args.push("-i".to_string());
            args.push(input.display().to_string());
        }

        for map in &self.maps {
            args.push("-map".to_string());
            args.push(map.clone());
        }

        args.extend(self.codec_defaults.iter().cloned());

        if let Some(codec) = &self.video_codec {
            args.push("-c:v".to_string());
            args.push(codec.clone());
        }
        match self.rate {
            Some(RateControl::ConstantQuality(crf)) => {
                args.push("-crf".to_string());
                args.push(crf.to_string());
            }
            Some(RateControl::Bitrate(kbps)) => {
                args.push("-b:v".to_string());
                args.push(format!("{kbps}k"));
            }
            None => {}
        }
        if let Some(preset) = &self.preset {
            args.push("-preset".to_string());
            args.push(preset.clone());
        }
        if let Some(pix_fmt) = &self.pix_fmt {
            args.push("-pix_fmt".to_string());
            args.push(pix_fmt.clone());
        }
        if !self.video_filters.is_empty() {
            args.push("-vf".to_string());
            args.push(self.video_filters.join(","));
        }
        if !self.audio_filters.is_empty() {
            args.push("-af".to_string());
            args.push(self.audio_filters.join(","));
        }
        if let Some(frames) = self.frames {
            args.push("-frames:v".to_string());
            args.push(frames.to_string());
        }
        if let Some(params) = self.x265_param_string() {
            args.push("-x265-params".to_string());
            args.push(params);
        }
        if let Some(limit) = self.limit {
            args.push("-t".to_string());
            args.push(format!("{limit:.3}"));
        }

        args.extend(self.extra_args.iter().cloned());

        match &self.output {
            OutputTarget::File(path) => args.push(path.display().to_string()),
            OutputTarget::Discard => {
                args.push("-f".to_string());
                args.push("null".to_string());
                args.push("-".to_string());
            }
        }

        args
    }
}
