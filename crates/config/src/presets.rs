//! Built-in named encoding presets
//!
//! A named preset bundles an x265 parameter fragment, a speed preset, a
//! video filter, and a bit-depth override. The table ships embedded in the
//! binary; the as-preset option selects one or more entries by name.

use std::sync::OnceLock;
use thiserror::Error;
use toml::Table;

/// Error type for preset resolution
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PresetError {
    /// The named preset does not exist in the table
    #[error("Unknown as-preset {0:?}")]
    UnknownPreset(String),

    /// A preset entry carries a key the resolver does not recognize
    #[error("Unknown as-preset setting {key:?} for as-preset {preset:?}")]
    UnknownPresetOption { preset: String, key: String },
}

/// Concrete settings produced by expanding one or more named presets
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedPreset {
    /// x265 parameter fragments, in resolution order
    pub x265_params: Vec<String>,
    /// Speed preset; later presets win
    pub preset: Option<String>,
    /// Video filters, in resolution order
    pub video_filters: Vec<String>,
    /// Output bit depth override; later presets win
    pub bitdepth: Option<u8>,
}

const PRESET_TABLE: &str = include_str!("presets.toml");

fn preset_table() -> &'static Table {
    static TABLE: OnceLock<Table> = OnceLock::new();
    TABLE.get_or_init(|| {
        PRESET_TABLE
            .parse::<Table>()
            .unwrap_or_else(|e| panic!("embedded preset table is invalid: {e}"))
    })
}

/// Expand a colon-separated list of preset names into concrete settings.
///
/// Names are resolved left to right; scalar settings from later names
/// override earlier ones while list settings accumulate. The literal name
/// `none` resolves to an empty expansion.
pub fn resolve_as_preset(spec: &str) -> Result<ResolvedPreset, PresetError> {
    let mut resolved = ResolvedPreset::default();
    if spec == "none" {
        return Ok(resolved);
    }

    for name in spec.split(':') {
        let entry = preset_table()
            .get(name)
            .and_then(|v| v.as_table())
            .ok_or_else(|| PresetError::UnknownPreset(name.to_string()))?;

        for (key, value) in entry {
            match key.as_str() {
                "x265-params" => {
                    if let Some(s) = value.as_str() {
                        resolved.x265_params.push(s.to_string());
                    }
                }
                "preset" => {
                    resolved.preset = value.as_str().map(str::to_string);
                }
                "video-filters" => {
                    if let Some(s) = value.as_str() {
                        resolved.video_filters.push(s.to_string());
                    }
                }
                "bitdepth" => {
                    resolved.bitdepth = value.as_integer().map(|b| b as u8);
                }
                other => {
                    return Err(PresetError::UnknownPresetOption {
                        preset: name.to_string(),
                        key: other.to_string(),
                    });
                }
            }
        }
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_resolves_to_empty() {
        let resolved = resolve_as_preset("none").expect("none always resolves");
        assert_eq!(resolved, ResolvedPreset::default());
    }

    #[test]
    fn test_unknown_preset_is_rejected() {
        let err = resolve_as_preset("does-not-exist").unwrap_err();
        assert_eq!(err, PresetError::UnknownPreset("does-not-exist".to_string()));
    }

    #[test]
    fn test_anime_preset_expands() {
        let resolved = resolve_as_preset("anime").expect("anime is built in");
        assert_eq!(resolved.preset.as_deref(), Some("slow"));
        assert_eq!(resolved.bitdepth, Some(10));
        assert_eq!(resolved.x265_params.len(), 1);
        assert!(resolved.x265_params[0].contains("psy-rd"));
    }

    #[test]
    fn test_chained_presets_accumulate() {
        let resolved = resolve_as_preset("grain:small").expect("both built in");
        // scalar settings: last name wins
        assert_eq!(resolved.preset.as_deref(), Some("veryslow"));
        // list settings accumulate in order
        assert_eq!(resolved.x265_params, vec!["tune=grain", "aq-mode=3:rd=4"]);
        assert_eq!(resolved.video_filters, vec!["hqdn3d=1.5:1.5:6:6"]);
    }

    #[test]
    fn test_chain_with_unknown_tail_fails() {
        let err = resolve_as_preset("anime:bogus").unwrap_err();
        assert_eq!(err, PresetError::UnknownPreset("bogus".to_string()));
    }

    #[test]
    fn test_every_builtin_preset_resolves() {
        for name in super::preset_table().keys() {
            resolve_as_preset(name)
                .unwrap_or_else(|e| panic!("builtin preset {name} failed to resolve: {e}"));
        }
    }
}
