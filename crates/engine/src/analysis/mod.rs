//! Source analysis passes
//!
//! Short ffmpeg runs that inspect the source before the real encode:
//! black-bar detection, loudness measurement, and interlace detection.
//! Each pass runs under the owning job's context so pause and stop
//! reach it like any other subprocess.

pub mod crop;
pub mod interlace;
pub mod loudness;

use std::collections::HashSet;
use std::io;
use std::process::Stdio;

use tokio::process::Command;

use crate::process::ProcessError;

/// Filter names compiled into the local ffmpeg build.
///
/// Normalization stages bail out with a clear error when the filter
/// they need is missing rather than letting ffmpeg fail mid-encode.
pub async fn available_filters() -> Result<HashSet<String>, ProcessError> {
    let output = Command::new("ffmpeg")
        .args(["-hide_banner", "-filters"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                ProcessError::ToolMissing("ffmpeg".to_string())
            } else {
                ProcessError::Io(e)
            }
        })?;

    Ok(parse_filter_list(&String::from_utf8_lossy(&output.stdout)))
}

/// Parse `ffmpeg -filters` output into the set of filter names.
///
/// Listing lines look like ` T.C yadif V->V Deinterlace the input image.`;
/// the name is the second whitespace-separated token.
fn parse_filter_list(listing: &str) -> HashSet<String> {
    listing
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let flags = tokens.next()?;
            let name = tokens.next()?;
            let io_spec = tokens.next()?;
            // flags are dots and letters; the io column contains "->"
            if flags.chars().all(|c| c == '.' || c.is_ascii_alphabetic())
                && io_spec.contains("->")
            {
                Some(name.to_string())
            } else {
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_listing_parses() {
        let listing = "\
Filters:
  T.. = Timeline support
  .S. = Slice threading
 ... anull             A->A       Pass the source unchanged to the output.
 T.C yadif             V->V       Deinterlace the input image.
 ..C loudnorm          A->A       EBU R128 loudness normalization
 ... volumedetect      A->A       Detect audio volume.
";
        let filters = parse_filter_list(listing);
        assert!(filters.contains("yadif"));
        assert!(filters.contains("loudnorm"));
        assert!(filters.contains("volumedetect"));
        assert!(!filters.contains("Filters:"));
        assert!(!filters.contains("="));
    }
}
