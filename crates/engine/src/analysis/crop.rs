//! Black-bar detection
//!
//! Samples a handful of short windows spread across the source, runs
//! cropdetect over each, and aggregates the per-sample rectangles into
//! one crop that never cuts into picture any sample considered real.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::command::EncodeCommand;
use crate::context::JobContext;
use crate::error::PipelineError;
use crate::process::{CommandSpec, ProcessError};

/// Number of sample points spread across the source duration.
pub const SAMPLE_INTERVALS: u32 = 12;
/// Frames decoded per sample point.
const SAMPLE_FRAMES: u32 = 2;

/// One detected crop rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub width: u32,
    pub height: u32,
    pub x: u32,
    pub y: u32,
}

impl CropRect {
    /// Render as an ffmpeg crop filter.
    pub fn filter(&self) -> String {
        format!("crop={}:{}:{}:{}", self.width, self.height, self.x, self.y)
    }

    /// Whether this crop actually removes anything from a source of the
    /// given dimensions.
    pub fn crops(&self, native_width: u32, native_height: u32) -> bool {
        self.width < native_width || self.height < native_height
    }
}

/// Combine per-sample rectangles into the widest safe crop.
///
/// Width and height are maximized independently, each keeping the
/// offset it was paired with, so a dark scene in one sample cannot
/// shave picture that another sample proved is there.
pub fn aggregate(samples: &[CropRect]) -> Option<CropRect> {
    let widest = samples.iter().max_by_key(|r| r.width)?;
    let tallest = samples.iter().max_by_key(|r| r.height)?;
    Some(CropRect {
        width: widest.width,
        x: widest.x,
        height: tallest.height,
        y: tallest.y,
    })
}

fn crop_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"crop=(\d+):(\d+):(\d+):(\d+)").expect("crop regex"))
}

/// Last cropdetect suggestion in a block of stderr lines.
pub fn parse_last_crop(lines: &[String]) -> Option<CropRect> {
    lines.iter().rev().find_map(|line| {
        let caps = crop_re().captures(line)?;
        Some(CropRect {
            width: caps[1].parse().ok()?,
            height: caps[2].parse().ok()?,
            x: caps[3].parse().ok()?,
            y: caps[4].parse().ok()?,
        })
    })
}

fn sample_spec(path: &Path, map_spec: &str, seek: Option<f64>) -> CommandSpec {
    let mut cmd = EncodeCommand::new(path)
        .map(map_spec)
        .video_codec("rawvideo")
        .video_filter("cropdetect=0.094:2:0")
        .discard_output();
    if let Some(seek) = seek {
        cmd = cmd.seek(seek).frames(SAMPLE_FRAMES);
    }
    CommandSpec::ffmpeg(cmd.build())
}

/// Detect the crop rectangle for one video stream.
///
/// Each sample seeks to its offset and decodes two frames; a sample
/// whose seeked run fails is retried once scanning from the start,
/// which is slow but survives containers with broken seek indexes.
pub async fn detect(
    ctx: &JobContext,
    path: &Path,
    map_spec: &str,
    duration: f64,
) -> Result<Option<CropRect>, PipelineError> {
    let interval = duration / f64::from(SAMPLE_INTERVALS + 1);
    let mut samples = Vec::new();

    for point in (1..=SAMPLE_INTERVALS).rev() {
        ctx.checkpoint().await?;
        let seek = interval * f64::from(point);
        let lines = match ctx.run_collect(&sample_spec(path, map_spec, Some(seek))).await {
            Ok(lines) => lines,
            Err(ProcessError::Killed) => return Err(PipelineError::StoppedPrematurely),
            Err(e) => {
                tracing::warn!(seek, error = %e, "seeked crop sample failed; rescanning from start");
                ctx.run_collect(&sample_spec(path, map_spec, None)).await?
            }
        };
        if let Some(rect) = parse_last_crop(&lines) {
            samples.push(rect);
        }
    }

    Ok(aggregate(&samples))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_keeps_paired_offsets() {
        let samples = vec![
            CropRect { width: 1904, height: 800, x: 8, y: 140 },
            CropRect { width: 1920, height: 792, x: 0, y: 144 },
        ];
        let combined = aggregate(&samples).expect("non-empty");
        // widest sample contributes width and x
        assert_eq!(combined.width, 1920);
        assert_eq!(combined.x, 0);
        // tallest sample contributes height and y
        assert_eq!(combined.height, 800);
        assert_eq!(combined.y, 140);
    }

    #[test]
    fn test_aggregate_with_repeated_samples() {
        let samples = vec![
            CropRect { width: 1920, height: 1072, x: 0, y: 4 },
            CropRect { width: 1920, height: 1072, x: 0, y: 4 },
            CropRect { width: 1920, height: 1076, x: 0, y: 2 },
        ];
        let combined = aggregate(&samples).expect("non-empty");
        assert_eq!(combined, CropRect { width: 1920, height: 1076, x: 0, y: 2 });
    }

    #[test]
    fn test_aggregate_of_nothing_is_none() {
        assert_eq!(aggregate(&[]), None);
    }

    #[test]
    fn test_last_crop_line_wins() {
        let lines = vec![
            "[Parsed_cropdetect_0 @ 0x1] x1:0 x2:1919 y1:138 y2:941 w:1920 h:800 x:0 y:140 pts:1 t:0.04 crop=1920:800:0:140".to_string(),
            "[Parsed_cropdetect_0 @ 0x1] x1:0 x2:1919 y1:140 y2:939 w:1920 h:796 x:0 y:142 pts:2 t:0.08 crop=1920:796:0:142".to_string(),
        ];
        let rect = parse_last_crop(&lines).expect("crop line present");
        assert_eq!(rect, CropRect { width: 1920, height: 796, x: 0, y: 142 });
    }

    #[test]
    fn test_no_crop_lines_yields_none() {
        let lines = vec!["Stream mapping:".to_string()];
        assert_eq!(parse_last_crop(&lines), None);
    }

    #[test]
    fn test_full_frame_crop_crops_nothing() {
        let rect = CropRect { width: 1920, height: 1080, x: 0, y: 0 };
        assert!(!rect.crops(1920, 1080));
        assert!(rect.crops(1920, 1088));
    }

    #[test]
    fn test_seeked_sample_spec_has_no_duration_cap() {
        let spec = sample_spec(Path::new("in.mkv"), "0:0", Some(120.0));
        let joined = spec.args.join(" ");
        assert!(joined.contains("-ss 120.000"));
        assert!(joined.contains("-frames:v 2"));
        assert!(!joined.contains("-t "));
        assert!(joined.contains("cropdetect=0.094:2:0"));
    }

    #[test]
    fn test_fallback_sample_spec_scans_whole_file() {
        let spec = sample_spec(Path::new("in.mkv"), "0:0", None);
        let joined = spec.args.join(" ");
        assert!(!joined.contains("-ss"));
        assert!(!joined.contains("-frames:v"));
    }
}
