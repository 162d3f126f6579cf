//! Configuration for the hevconv batch transcoder
//!
//! Holds the resolved option snapshot a job consumes, TOML config file
//! loading, and the built-in encoding preset table.

pub mod options;
pub mod presets;

pub use options::{Config, ConfigError, EncodeOptions};
pub use presets::{resolve_as_preset, PresetError, ResolvedPreset};
