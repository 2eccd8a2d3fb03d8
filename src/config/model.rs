// src/config/model.rs

use std::path::PathBuf;

use serde::Deserialize;

use crate::types::StoreMode;

/// Configuration as read from a TOML file, before validation.
///
/// ```toml
/// [engine]
/// max_steps = 100
/// branch_timeout_ms = 30000
/// fanout_timeout_ms = 60000
///
/// [loop]
/// max_attempts = 3
///
/// [store]
/// mode = "sqlite"
/// path = ".stepflow/checkpoints.db"
/// ```
///
/// All sections are optional and have reasonable defaults.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RawConfigFile {
    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default, rename = "loop")]
    pub loops: LoopSection,

    #[serde(default)]
    pub store: StoreSection,
}

/// Validated configuration. Only obtainable through
/// `ConfigFile::try_from(raw)` or [`ConfigFile::default`].
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub engine: EngineSection,
    pub loops: LoopSection,
    pub store: StoreSection,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(raw: RawConfigFile) -> Self {
        Self {
            engine: raw.engine,
            loops: raw.loops,
            store: raw.store,
        }
    }
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self::new_unchecked(RawConfigFile::default())
    }
}

/// `[engine]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSection {
    /// Steps a single start/resume may execute before the run is
    /// terminated.
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,

    /// Per-branch timeout inside a fan-out group.
    #[serde(default = "default_branch_timeout_ms")]
    pub branch_timeout_ms: u64,

    /// Timeout for a whole fan-out group.
    #[serde(default = "default_fanout_timeout_ms")]
    pub fanout_timeout_ms: u64,
}

fn default_max_steps() -> u64 {
    100
}

fn default_branch_timeout_ms() -> u64 {
    30_000
}

fn default_fanout_timeout_ms() -> u64 {
    60_000
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            branch_timeout_ms: default_branch_timeout_ms(),
            fanout_timeout_ms: default_fanout_timeout_ms(),
        }
    }
}

/// `[loop]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoopSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for LoopSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

/// `[store]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreSection {
    #[serde(default)]
    pub mode: StoreMode,

    /// SQLite database file; ignored in memory mode.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".stepflow/checkpoints.db")
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            mode: StoreMode::default(),
            path: default_store_path(),
        }
    }
}
