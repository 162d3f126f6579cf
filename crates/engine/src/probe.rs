//! Source metadata probing
//!
//! Runs ffprobe in JSON mode and deserializes the format and stream
//! sections. ffprobe reports most numeric fields as strings, so the
//! deserializers here accept either form.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::process::Stdio;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tokio::process::Command;

use crate::process::ProcessError;

/// Error type for metadata probing
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe failed to run
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// ffprobe produced output that does not parse as probe JSON
    #[error("Failed to parse probe output: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Container-level metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormatInfo {
    #[serde(default)]
    pub format_name: Option<String>,
    #[serde(default, deserialize_with = "de_lenient_f64")]
    pub duration: Option<f64>,
    #[serde(default, deserialize_with = "de_lenient_u64")]
    pub size: Option<u64>,
    #[serde(default, deserialize_with = "de_lenient_u64")]
    pub bit_rate: Option<u64>,
}

/// One probed stream
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamInfo {
    pub index: u32,
    #[serde(default)]
    pub codec_type: Option<String>,
    #[serde(default)]
    pub codec_name: Option<String>,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub pix_fmt: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub channels: Option<u32>,
    #[serde(default)]
    pub avg_frame_rate: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub disposition: HashMap<String, i64>,
}

impl StreamInfo {
    /// Stream title tag, either capitalization.
    pub fn title(&self) -> Option<&str> {
        self.tags
            .get("title")
            .or_else(|| self.tags.get("TITLE"))
            .map(String::as_str)
    }

    /// Raw language tag, either capitalization.
    pub fn language_tag(&self) -> Option<&str> {
        self.tags
            .get("language")
            .or_else(|| self.tags.get("LANGUAGE"))
            .map(String::as_str)
    }

    /// Frame rate evaluated from ffprobe's fraction notation.
    pub fn frame_rate(&self) -> Option<f64> {
        parse_frame_rate(self.avg_frame_rate.as_deref()?)
    }
}

/// Full probe result for one media file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub format: FormatInfo,
    #[serde(default)]
    pub streams: Vec<StreamInfo>,
}

/// Parse ffprobe's `num/den` frame rate notation.
pub fn parse_frame_rate(raw: &str) -> Option<f64> {
    match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                None
            } else {
                Some(num / den)
            }
        }
        None => raw.trim().parse().ok(),
    }
}

/// Probe a media file with ffprobe.
pub async fn probe(path: &Path) -> Result<Metadata, ProbeError> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                ProcessError::ToolMissing("ffprobe".to_string())
            } else {
                ProcessError::Io(e)
            }
        })?;

    if !output.status.success() {
        return Err(ProcessError::NonZeroExit {
            tool: "ffprobe".to_string(),
            code: output.status.code().unwrap_or(-1),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
        .into());
    }

    Ok(parse_probe_json(&output.stdout)?)
}

pub(crate) fn parse_probe_json(raw: &[u8]) -> Result<Metadata, serde_json::Error> {
    serde_json::from_slice(raw)
}

fn de_lenient_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(f64),
        Str(String),
    }
    Ok(match Option::<Raw>::deserialize(d)? {
        Some(Raw::Num(n)) => Some(n),
        Some(Raw::Str(s)) => s.parse().ok(),
        None => None,
    })
}

fn de_lenient_u64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Str(String),
    }
    Ok(match Option::<Raw>::deserialize(d)? {
        Some(Raw::Num(n)) => Some(n),
        Some(Raw::Str(s)) => s.parse().ok(),
        None => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "format": {
            "format_name": "matroska,webm",
            "duration": "1432.512000",
            "size": "734003200",
            "bit_rate": "4099072"
        },
        "streams": [
            {
                "index": 0,
                "codec_type": "video",
                "codec_name": "h264",
                "profile": "High",
                "pix_fmt": "yuv420p",
                "width": 1920,
                "height": 1080,
                "avg_frame_rate": "24000/1001",
                "tags": {"language": "und"},
                "disposition": {"default": 1}
            },
            {
                "index": 1,
                "codec_type": "audio",
                "codec_name": "ac3",
                "channels": 6,
                "avg_frame_rate": "0/0",
                "tags": {"language": "eng", "title": "Surround"}
            }
        ]
    }"#;

    #[test]
    fn test_probe_json_parses() {
        let meta = parse_probe_json(SAMPLE.as_bytes()).expect("sample parses");
        assert_eq!(meta.format.format_name.as_deref(), Some("matroska,webm"));
        assert_eq!(meta.format.duration, Some(1432.512));
        assert_eq!(meta.format.size, Some(734_003_200));
        assert_eq!(meta.streams.len(), 2);
    }

    #[test]
    fn test_stream_accessors() {
        let meta = parse_probe_json(SAMPLE.as_bytes()).expect("sample parses");
        let video = &meta.streams[0];
        let fps = video.frame_rate().expect("fractional frame rate");
        assert!((fps - 23.976).abs() < 0.001);
        assert_eq!(video.title(), None);

        let audio = &meta.streams[1];
        assert_eq!(audio.language_tag(), Some("eng"));
        assert_eq!(audio.title(), Some("Surround"));
        assert_eq!(audio.frame_rate(), None);
    }

    #[test]
    fn test_missing_duration_is_none() {
        let raw = br#"{"format": {"format_name": "srt"}, "streams": []}"#;
        let meta = parse_probe_json(raw).expect("parses");
        assert_eq!(meta.format.duration, None);
        assert_eq!(meta.format.format_name.as_deref(), Some("srt"));
    }

    #[test]
    fn test_frame_rate_notation() {
        assert_eq!(parse_frame_rate("25/1"), Some(25.0));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("23.976"), Some(23.976));
        assert_eq!(parse_frame_rate("garbage"), None);
    }

    #[test]
    fn test_numeric_fields_accept_numbers_too() {
        let raw = br#"{"format": {"duration": 12.5, "size": 1024}, "streams": []}"#;
        let meta = parse_probe_json(raw).expect("parses");
        assert_eq!(meta.format.duration, Some(12.5));
        assert_eq!(meta.format.size, Some(1024));
    }
}
