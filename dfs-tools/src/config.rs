//! Layered TOML configuration, CLI-override-wins-over-file-wins-over-default.
//!
//! A config struct is loaded once and threaded explicitly through the
//! `MasterConfig`/`ChunkserverConfig` structs that own it, rather than
//! read through global accessor functions.

use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

/// Loads and parses a TOML config file. A missing file is not an error —
/// callers combine the result with `Default::default()` so a daemon can
/// start from built-in defaults alone.
pub fn load_toml<T: DeserializeOwned + Default>(path: Option<&Path>) -> Result<T> {
    let Some(path) = path else {
        return Ok(T::default());
    };
    if !path.exists() {
        return Ok(T::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&text)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

/// CLI flags win over file values, file values win over built-in defaults.
/// `cli` and `file` are `Option` overlays on top of a hard-coded `default`.
pub fn resolve<T>(cli: Option<T>, file: Option<T>, default: T) -> T {
    cli.or(file).unwrap_or(default)
}
