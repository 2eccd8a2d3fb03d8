// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::Result;

/// Load a configuration file from a given path and return the raw `RawConfigFile`.
///
/// This only performs TOML deserialization; it does **not** check value
/// ranges. Use [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let config: RawConfigFile = toml::from_str(&contents)?;

    Ok(config)
}

/// Load a configuration file from path and validate it.
///
/// A missing file at the default location is not an error: the defaults
/// apply. A missing file anywhere else is.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let path = path.as_ref();
    if !path.exists() && path == default_config_path() {
        debug!(path = %path.display(), "no config file, using defaults");
        return Ok(ConfigFile::default());
    }
    let raw_config = load_from_path(path)?;
    let config = ConfigFile::try_from(raw_config)?;
    Ok(config)
}

/// `Stepflow.toml` in the current working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("Stepflow.toml")
}
