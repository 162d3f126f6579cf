//! Encode progress parsing and reporting
//!
//! ffmpeg prints carriage-return separated status lines on stderr while
//! encoding; this module turns them into structured progress snapshots
//! with percentage, throughput, ETA and an estimated final size.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

/// Fields lifted straight off one ffmpeg status line
#[derive(Debug, Clone, PartialEq)]
pub struct RawProgress {
    pub frames: Option<u64>,
    pub fps: Option<f64>,
    pub timemark: String,
}

/// Derived progress snapshot for one encode
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressReport {
    /// Percent of source duration encoded, 0-100
    pub percent: f64,
    /// Encoder throughput in frames per second
    pub fps: f64,
    /// Encode speed as a multiple of realtime
    pub speed: f64,
    /// Wall time spent so far
    pub elapsed: Duration,
    /// Projected time remaining
    pub eta: Duration,
    /// Source timestamp most recently encoded
    pub timemark: String,
    /// Projected final output size in bytes, once enough is written
    pub estimated_size: Option<u64>,
}

fn status_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"frame=\s*(\d+)\s+fps=\s*([\d.]+).*?time=\s*(\S+)").expect("status regex")
    })
}

fn timemark_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"time=\s*([0-9:.]+)").expect("timemark regex"))
}

/// Parse one ffmpeg status line. Returns `None` for ordinary log lines.
pub fn parse_status_line(line: &str) -> Option<RawProgress> {
    let caps = status_line_re().captures(line)?;
    Some(RawProgress {
        frames: caps[1].parse().ok(),
        fps: caps[2].parse().ok(),
        timemark: caps[3].to_string(),
    })
}

/// Last `time=` mark found in a block of stderr lines, as seconds.
///
/// Used to recover a duration when the container reports none: a discard
/// decode pass leaves its final timestamp in the trailing status line.
pub fn last_timemark_secs(lines: &[String]) -> Option<f64> {
    lines.iter().rev().find_map(|line| {
        let caps = timemark_re().captures(line)?;
        parse_timemark(&caps[1])
    })
}

/// Parse an `HH:MM:SS.ff` timemark into seconds.
///
/// Short fractional parts are right-padded to millisecond precision
/// before parsing so `.5` means 500ms, not 5ms.
pub fn parse_timemark(mark: &str) -> Option<f64> {
    let mut parts = mark.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = pad_fraction(parts.next()?).parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

fn pad_fraction(seconds: &str) -> String {
    match seconds.split_once('.') {
        Some((whole, frac)) if frac.len() < 3 => {
            format!("{whole}.{frac:0<3}")
        }
        _ => seconds.to_string(),
    }
}

/// Seconds rendered as `HH:MM:SS` for logs and the stats file.
pub fn format_hms(total_secs: f64) -> String {
    let total = total_secs.max(0.0).round() as u64;
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

impl ProgressReport {
    /// Derive a snapshot from a raw status line.
    ///
    /// `duration` is the full source duration, `frame_rate` the source
    /// video frame rate, `output_size` the bytes written so far. Size is
    /// only projected once ten percent of the source has been encoded;
    /// earlier extrapolations swing too wildly to be useful.
    pub fn derive(
        raw: &RawProgress,
        duration: f64,
        frame_rate: f64,
        elapsed: Duration,
        output_size: Option<u64>,
    ) -> Self {
        let encoded_secs = parse_timemark(&raw.timemark).unwrap_or(0.0);
        let percent = if duration > 0.0 {
            (encoded_secs / duration * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };
        let fps = raw.fps.unwrap_or(0.0);
        let speed = if frame_rate > 0.0 { fps / frame_rate } else { 0.0 };
        let eta_secs = if speed > 0.0 {
            (duration - encoded_secs).max(0.0) / speed
        } else {
            0.0
        };
        let estimated_size = match output_size {
            Some(bytes) if percent > 10.0 => Some((bytes as f64 / percent * 100.0) as u64),
            _ => None,
        };

        Self {
            percent,
            fps,
            speed,
            elapsed,
            eta: Duration::from_secs_f64(eta_secs),
            timemark: raw.timemark.clone(),
            estimated_size,
        }
    }
}
