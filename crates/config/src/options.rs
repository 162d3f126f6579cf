//! Option snapshot and TOML config loading

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Resolved configuration snapshot consumed by a job.
///
/// Immutable once a job enters its first stage, except for the fields the
/// pipeline itself mutates as stage outcomes (preset and bitdepth may be
/// overwritten by named-preset expansion).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodeOptions {
    /// CRF value for constant-quality encoding
    #[serde(default = "default_quality")]
    pub quality: u8,
    /// Target video bitrate in kbps; None selects constant quality
    #[serde(default)]
    pub video_bitrate: Option<u32>,
    /// x265 speed preset (ultrafast..placebo)
    #[serde(default)]
    pub preset: Option<String>,
    /// Container extension for produced files
    #[serde(default = "default_output_format")]
    pub output_format: String,
    /// Directory encoded output is written to
    #[serde(default = "default_destination")]
    pub destination: PathBuf,
    /// Normalization aggressiveness, 0-5; gates several analysis stages
    #[serde(default = "default_normalize_level")]
    pub normalize_level: u8,
    /// Language used to pick default audio/subtitle tracks
    #[serde(default)]
    pub native_language: Option<String>,
    /// Encode only a short window centered at the source midpoint
    #[serde(default)]
    pub preview: bool,
    /// Length of the preview/sample window in milliseconds
    #[serde(default = "default_preview_length_ms")]
    pub preview_length_ms: u64,
    /// Number of bitrate-controlled encode passes
    #[serde(default = "default_multi_pass")]
    pub multi_pass: u32,
    /// Output bit depth override; detected from the source when None
    #[serde(default)]
    pub bitdepth: Option<u8>,
    /// Colon-separated named presets expanded at stage 4
    #[serde(default)]
    pub as_preset: Option<String>,
    /// Scale output to this height, preserving aspect ratio
    #[serde(default)]
    pub scale: Option<u32>,
    /// Extra x265 parameters appended verbatim
    #[serde(default)]
    pub extra_options: Option<String>,
    /// Per-channel bitrate (kbps) for high-efficiency audio
    #[serde(default = "default_he_audio_bitrate")]
    pub he_audio_bitrate: u32,
    /// Re-encode sources already in the target codec
    #[serde(default)]
    pub override_encode: bool,
    /// Replace the source file with the encoded output
    #[serde(default)]
    pub delete_source: bool,
    /// Produce six stills from the encoded output
    #[serde(default)]
    pub screenshots: bool,
    /// Extract a short stream-copy sample clip
    #[serde(default)]
    pub sample: bool,
    /// Append a CSV stats row per finished encode
    #[serde(default)]
    pub stats: bool,
    /// Dry-run mode; the encode stage refuses to spawn the external tool
    #[serde(default)]
    pub test: bool,
    /// Re-encode non-lossless audio to a low-bitrate codec
    #[serde(default)]
    pub he_audio: bool,
    /// Apply high-efficiency audio even to lossless streams
    #[serde(default)]
    pub force_he_audio: bool,
    /// Downmix high-efficiency audio to stereo above 3 channels
    #[serde(default)]
    pub downmix_he_audio: bool,
    /// Force a keyframe interval of one second
    #[serde(default)]
    pub accurate_timestamps: bool,
    /// Skip bitmap-subtitle upconversion
    #[serde(default)]
    pub skip_upconvert: bool,
    /// Path of the stats CSV file
    #[serde(default = "default_stats_file")]
    pub stats_file: PathBuf,
}

fn default_quality() -> u8 {
    19
}

fn default_output_format() -> String {
    "mkv".to_string()
}

fn default_destination() -> PathBuf {
    PathBuf::from(".")
}

fn default_normalize_level() -> u8 {
    2
}

fn default_preview_length_ms() -> u64 {
    30_000
}

fn default_multi_pass() -> u32 {
    1
}

fn default_he_audio_bitrate() -> u32 {
    40
}

fn default_stats_file() -> PathBuf {
    PathBuf::from("hevconv.csv")
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            quality: default_quality(),
            video_bitrate: None,
            preset: None,
            output_format: default_output_format(),
            destination: default_destination(),
            normalize_level: default_normalize_level(),
            native_language: None,
            preview: false,
            preview_length_ms: default_preview_length_ms(),
            multi_pass: default_multi_pass(),
            bitdepth: None,
            as_preset: None,
            scale: None,
            extra_options: None,
            he_audio_bitrate: default_he_audio_bitrate(),
            override_encode: false,
            delete_source: false,
            screenshots: false,
            sample: false,
            stats: false,
            test: false,
            he_audio: false,
            force_he_audio: false,
            downmix_he_audio: false,
            accurate_timestamps: false,
            skip_upconvert: false,
            stats_file: default_stats_file(),
        }
    }
}

impl EncodeOptions {
    /// Whether bitrate-targeted rate control is selected
    pub fn bitrate_mode(&self) -> bool {
        self.video_bitrate.is_some()
    }

    /// Preview/sample window length in seconds
    pub fn preview_length_secs(&self) -> f64 {
        self.preview_length_ms as f64 / 1000.0
    }
}

/// On-disk configuration file
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub encoding: EncodeOptions,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("empty TOML should parse");
        let opts = config.encoding;

        assert_eq!(opts.quality, 19);
        assert_eq!(opts.video_bitrate, None);
        assert_eq!(opts.output_format, "mkv");
        assert_eq!(opts.normalize_level, 2);
        assert_eq!(opts.multi_pass, 1);
        assert_eq!(opts.he_audio_bitrate, 40);
        assert_eq!(opts.preview_length_ms, 30_000);
        assert!(!opts.preview);
        assert!(!opts.delete_source);
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let toml_str = r#"
[encoding]
quality = 23
native_language = "eng"
delete_source = true
"#;
        let config = Config::parse_toml(toml_str).expect("partial TOML should parse");
        let opts = config.encoding;

        assert_eq!(opts.quality, 23);
        assert_eq!(opts.native_language.as_deref(), Some("eng"));
        assert!(opts.delete_source);
        assert_eq!(opts.output_format, "mkv"); // default
        assert_eq!(opts.multi_pass, 1); // default
    }

    #[test]
    fn test_rate_control_selection() {
        let mut opts = EncodeOptions::default();
        assert!(!opts.bitrate_mode());
        opts.video_bitrate = Some(2500);
        assert!(opts.bitrate_mode());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_config_roundtrips_encoding_section(
            quality in 0u8..52,
            bitrate in proptest::option::of(100u32..50_000),
            normalize in 0u8..6,
            multi_pass in 1u32..4,
        ) {
            let opts = EncodeOptions {
                quality,
                video_bitrate: bitrate,
                normalize_level: normalize,
                multi_pass,
                ..EncodeOptions::default()
            };
            let config = Config { encoding: opts.clone() };
            let serialized = toml::to_string(&config).expect("serializes");
            let parsed = Config::parse_toml(&serialized).expect("parses back");
            prop_assert_eq!(parsed.encoding, opts);
        }
    }
}
