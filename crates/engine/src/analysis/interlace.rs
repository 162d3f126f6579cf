//! Interlace detection
//!
//! Decodes a bounded run of frames through the idet filter and reads
//! its closing tally. The source counts as interlaced when field-order
//! detections outnumber progressive ones.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::command::EncodeCommand;
use crate::context::JobContext;
use crate::error::PipelineError;
use crate::process::CommandSpec;

/// Frames decoded for the detection run.
pub const DETECT_FRAMES: u32 = 250;

/// idet's closing tally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldTally {
    pub tff: u64,
    pub bff: u64,
    pub progressive: u64,
}

impl FieldTally {
    /// Interlaced when field detections meet or beat progressive ones.
    pub fn is_interlaced(&self) -> bool {
        self.tff + self.bff >= self.progressive
    }
}

fn tally_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"TFF:\s*(\d+)\s+BFF:\s*(\d+)\s+Progressive:\s*(\d+)").expect("idet regex")
    })
}

/// Last tally printed by idet; the multi-frame summary comes last.
pub fn parse_tally(lines: &[String]) -> Option<FieldTally> {
    lines.iter().rev().find_map(|line| {
        let caps = tally_re().captures(line)?;
        Some(FieldTally {
            tff: caps[1].parse().ok()?,
            bff: caps[2].parse().ok()?,
            progressive: caps[3].parse().ok()?,
        })
    })
}

/// Run idet over the start of the source video.
pub async fn detect(ctx: &JobContext, path: &Path) -> Result<bool, PipelineError> {
    let cmd = EncodeCommand::new(path)
        .map("0:v")
        .video_codec("rawvideo")
        .video_filter("idet")
        .frames(DETECT_FRAMES)
        .discard_output();
    let lines = ctx.run_collect(&CommandSpec::ffmpeg(cmd.build())).await?;
    Ok(parse_tally(&lines).is_some_and(|t| t.is_interlaced()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idet_output(single: (u64, u64, u64), multi: (u64, u64, u64)) -> Vec<String> {
        vec![
            format!(
                "[Parsed_idet_0 @ 0x1] Single frame detection: TFF: {} BFF: {} Progressive: {} Undetermined: 0",
                single.0, single.1, single.2
            ),
            format!(
                "[Parsed_idet_0 @ 0x1] Multi frame detection: TFF: {} BFF: {} Progressive: {} Undetermined: 0",
                multi.0, multi.1, multi.2
            ),
        ]
    }

    #[test]
    fn test_trailing_tally_wins() {
        let lines = idet_output((10, 0, 240), (200, 0, 50));
        let tally = parse_tally(&lines).expect("tally present");
        assert_eq!(tally, FieldTally { tff: 200, bff: 0, progressive: 50 });
    }

    #[test]
    fn test_progressive_source_is_not_interlaced() {
        let tally = FieldTally { tff: 1, bff: 0, progressive: 249 };
        assert!(!tally.is_interlaced());
    }

    #[test]
    fn test_field_majority_is_interlaced() {
        let tally = FieldTally { tff: 120, bff: 60, progressive: 70 };
        assert!(tally.is_interlaced());
    }

    #[test]
    fn test_exact_tie_counts_as_interlaced() {
        let tally = FieldTally { tff: 100, bff: 25, progressive: 125 };
        assert!(tally.is_interlaced());
    }

    #[test]
    fn test_no_tally_lines() {
        assert_eq!(parse_tally(&["Stream mapping:".to_string()]), None);
    }
}
