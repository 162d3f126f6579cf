//! Bitmap subtitle upconversion
//!
//! DVD bitmap subtitles cannot be muxed alongside text tracks in the
//! output container, so they are extracted with mkvextract, OCRed to
//! SubRip with vobsub2srt, and fed back in as extra inputs.

use std::path::{Path, PathBuf};

use crate::context::JobContext;
use crate::error::PipelineError;
use crate::process::CommandSpec;

/// Directory under the system temp dir holding extracted tracks.
fn work_dir() -> PathBuf {
    std::env::temp_dir().join("hevconv")
}

fn track_stem(source: &Path, track_index: u32) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "track".to_string());
    work_dir().join(format!("{stem}-{track_index}"))
}

/// Extract one track from a matroska file.
///
/// Returns the extraction stem; mkvextract appends the idx/sub pair
/// itself for vobsub tracks.
pub async fn extract_track(
    ctx: &JobContext,
    source: &Path,
    track_index: u32,
) -> Result<PathBuf, PipelineError> {
    tokio::fs::create_dir_all(work_dir()).await?;
    let stem = track_stem(source, track_index);
    let spec = CommandSpec::new(
        "mkvextract",
        vec![
            "tracks".to_string(),
            source.display().to_string(),
            format!("{}:{}", track_index, stem.display()),
        ],
    );
    ctx.run_collect(&spec).await?;
    Ok(stem)
}

/// OCR an extracted vobsub pair into a SubRip file.
///
/// vobsub2srt takes the extraction stem and writes `<stem>.srt` next
/// to it.
pub async fn vobsub_to_srt(ctx: &JobContext, stem: &Path) -> Result<PathBuf, PipelineError> {
    let spec = CommandSpec::new("vobsub2srt", vec![stem.display().to_string()]);
    ctx.run_collect(&spec).await?;
    Ok(stem.with_extension("srt"))
}

/// Files the extraction leaves behind for one track.
pub fn artifact_paths(stem: &Path) -> Vec<PathBuf> {
    vec![
        stem.with_extension("idx"),
        stem.with_extension("sub"),
        stem.with_extension("srt"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_stem_is_source_and_index_scoped() {
        let stem = track_stem(Path::new("/media/A Movie (2008).mkv"), 3);
        let name = stem.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name, "A Movie (2008)-3");
        assert!(stem.starts_with(std::env::temp_dir()));
    }

    #[test]
    fn test_artifacts_cover_the_extraction_outputs() {
        let artifacts = artifact_paths(Path::new("/tmp/hevconv/film-2"));
        let exts: Vec<_> = artifacts
            .iter()
            .filter_map(|p| p.extension().map(|e| e.to_string_lossy().into_owned()))
            .collect();
        assert_eq!(exts, vec!["idx", "sub", "srt"]);
    }
}
