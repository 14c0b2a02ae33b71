// src/config/loader.rs

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::config::model::{EngineConfig, RawEngineConfig};

/// Load a configuration file from a given path and return the raw form.
///
/// This only performs TOML deserialization; it does **not** perform semantic
/// validation. Use [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawEngineConfig> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .with_context(|| format!("reading config file at {:?}", path))?;

    let config: RawEngineConfig = toml::from_str(&contents)
        .with_context(|| format!("parsing TOML config from {:?}", path))?;

    Ok(config)
}

/// Load a configuration file from path and run basic validation.
///
/// This is the recommended entry point: reads TOML, applies serde defaults,
/// and checks the invariants serde cannot express (non-empty wrapper argv,
/// positive poll interval).
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<EngineConfig> {
    let raw = load_from_path(&path)?;
    let config = EngineConfig::try_from(raw)
        .with_context(|| format!("validating config from {:?}", path.as_ref()))?;
    Ok(config)
}
