//! Audio loudness measurement
//!
//! Two normalization strategies, both measure-then-apply:
//! peak normalization reads per-stream maximum volume with
//! volumedetect, loudness normalization runs a first loudnorm pass and
//! feeds the measured values into a linear second pass.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use crate::command::EncodeCommand;
use crate::context::JobContext;
use crate::error::PipelineError;
use crate::process::CommandSpec;
use crate::streams::ClassifiedStream;

/// Headroom subtracted from the detected peak, in dB.
const PEAK_HEADROOM_DB: f64 = 2.0;

/// First-pass measurement printed by the loudnorm filter.
///
/// Values stay as the strings ffmpeg printed; they are interpolated
/// verbatim into the second-pass filter.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LoudnormMeasurement {
    pub input_i: String,
    pub input_lra: String,
    pub input_tp: String,
    pub input_thresh: String,
    pub target_offset: String,
}

impl LoudnormMeasurement {
    /// Render the linear second-pass filter for these measurements.
    pub fn second_pass_filter(&self) -> String {
        format!(
            "loudnorm=I=-16:TP=-2.0:LRA=11:measured_I={}:measured_LRA={}:measured_TP={}:measured_thresh={}:offset={}:linear=true:print_format=summary",
            self.input_i, self.input_lra, self.input_tp, self.input_thresh, self.target_offset
        )
    }
}

/// Extract the last loudnorm measurement block from collected stderr.
///
/// The filter prints one JSON block per measured stream; the last block
/// wins and is applied to the whole audio filter chain.
pub fn parse_loudnorm(lines: &[String]) -> Option<LoudnormMeasurement> {
    let joined = lines.join("\n");
    let marker = joined.rfind("[Parsed_loudnorm")?;
    let tail = &joined[marker..];
    let start = tail.find('{')?;
    let end = tail.rfind('}')?;
    serde_json::from_str(&tail[start..=end]).ok()
}

fn volume_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"max_volume:\s*(-?[0-9]+(?:\.[0-9]+)?)\s*dB").expect("volume regex"))
}

/// Per-stream peak volumes in filter-application order.
pub fn parse_max_volumes(lines: &[String]) -> Vec<f64> {
    lines
        .iter()
        .filter_map(|line| {
            let caps = volume_re().captures(line)?;
            caps[1].parse().ok()
        })
        .collect()
}

/// Gain that lifts a measured peak to just under full scale.
pub fn peak_gain_db(max_volume: f64) -> f64 {
    -max_volume - PEAK_HEADROOM_DB
}

fn measurement_spec(
    path: &Path,
    audio: &[ClassifiedStream],
    filter: &str,
    window: Option<(f64, f64)>,
) -> CommandSpec {
    let mut cmd = EncodeCommand::new(path);
    if let Some((seek, length)) = window {
        cmd = cmd.window(seek, length);
    }
    for stream in audio {
        cmd = cmd.map(stream.map_spec());
    }
    cmd = cmd.audio_filter(filter).discard_output();
    CommandSpec::ffmpeg(cmd.build())
}

/// Run the loudnorm measurement pass.
pub async fn measure_loudnorm(
    ctx: &JobContext,
    path: &Path,
    audio: &[ClassifiedStream],
    window: Option<(f64, f64)>,
) -> Result<Option<LoudnormMeasurement>, PipelineError> {
    let spec = measurement_spec(path, audio, "loudnorm=I=-16:TP=-2.0:LRA=11:print_format=json", window);
    let lines = ctx.run_collect(&spec).await?;
    Ok(parse_loudnorm(&lines))
}

/// Run the volumedetect measurement pass.
///
/// Returns one peak per mapped audio stream, in map order.
pub async fn measure_peaks(
    ctx: &JobContext,
    path: &Path,
    audio: &[ClassifiedStream],
    window: Option<(f64, f64)>,
) -> Result<Vec<f64>, PipelineError> {
    let spec = measurement_spec(path, audio, "volumedetect", window);
    let lines = ctx.run_collect(&spec).await?;
    Ok(parse_max_volumes(&lines))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loudnorm_json_block_parses() {
        let lines = vec![
            "[Parsed_loudnorm_0 @ 0x55f] ".to_string(),
            "{".to_string(),
            "\t\"input_i\" : \"-27.61\",".to_string(),
            "\t\"input_tp\" : \"-4.47\",".to_string(),
            "\t\"input_lra\" : \"18.06\",".to_string(),
            "\t\"input_thresh\" : \"-39.20\",".to_string(),
            "\t\"output_i\" : \"-16.58\",".to_string(),
            "\t\"output_tp\" : \"-2.00\",".to_string(),
            "\t\"output_lra\" : \"14.78\",".to_string(),
            "\t\"output_thresh\" : \"-27.71\",".to_string(),
            "\t\"normalization_type\" : \"dynamic\",".to_string(),
            "\t\"target_offset\" : \"0.58\"".to_string(),
            "}".to_string(),
        ];
        let measured = parse_loudnorm(&lines).expect("block parses");
        assert_eq!(measured.input_i, "-27.61");
        assert_eq!(measured.target_offset, "0.58");
    }

    #[test]
    fn test_last_block_wins_with_multiple_streams() {
        let mut lines = vec![
            "[Parsed_loudnorm_0 @ 0x1]".to_string(),
            r#"{ "input_i": "-20.00", "input_tp": "-3.00", "input_lra": "9.0", "input_thresh": "-30.0", "target_offset": "0.10" }"#.to_string(),
            "[Parsed_loudnorm_1 @ 0x2]".to_string(),
            r#"{ "input_i": "-25.00", "input_tp": "-5.00", "input_lra": "12.0", "input_thresh": "-35.0", "target_offset": "0.20" }"#.to_string(),
        ];
        let measured = parse_loudnorm(&lines).expect("parses");
        assert_eq!(measured.input_i, "-25.00");

        lines.truncate(2);
        let measured = parse_loudnorm(&lines).expect("parses");
        assert_eq!(measured.input_i, "-20.00");
    }

    #[test]
    fn test_second_pass_filter_interpolates_measurements() {
        let measured = LoudnormMeasurement {
            input_i: "-27.61".to_string(),
            input_lra: "18.06".to_string(),
            input_tp: "-4.47".to_string(),
            input_thresh: "-39.20".to_string(),
            target_offset: "0.58".to_string(),
        };
        let filter = measured.second_pass_filter();
        assert!(filter.starts_with("loudnorm=I=-16:TP=-2.0:LRA=11:"));
        assert!(filter.contains("measured_I=-27.61"));
        assert!(filter.contains("measured_LRA=18.06"));
        assert!(filter.contains("measured_TP=-4.47"));
        assert!(filter.contains("measured_thresh=-39.20"));
        assert!(filter.contains("offset=0.58"));
        assert!(filter.contains("linear=true"));
    }

    #[test]
    fn test_max_volumes_parse_in_order() {
        let lines = vec![
            "[Parsed_volumedetect_0 @ 0x1] mean_volume: -25.1 dB".to_string(),
            "[Parsed_volumedetect_0 @ 0x1] max_volume: -4.0 dB".to_string(),
            "[Parsed_volumedetect_1 @ 0x2] max_volume: -10.5 dB".to_string(),
        ];
        assert_eq!(parse_max_volumes(&lines), vec![-4.0, -10.5]);
    }

    #[test]
    fn test_peak_gain_leaves_headroom() {
        assert_eq!(peak_gain_db(-4.0), 2.0);
        assert_eq!(peak_gain_db(-1.5), -0.5);
        // already at full scale: gain goes negative by the headroom
        assert_eq!(peak_gain_db(0.0), -2.0);
    }
}
