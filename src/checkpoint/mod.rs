// src/checkpoint/mod.rs

//! Durable run history.
//!
//! The engine only talks to the [`CheckpointStore`] trait; the concrete
//! backend is chosen by the caller and injected into the engine.
//!
//! - [`memory`]: process-local store, used with `--no-persistence` and in tests.
//! - [`sqlite`]: durable store backed by `rusqlite`.

pub mod memory;
pub mod sqlite;

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::errors::Result;
use crate::state::ExecutionState;
use crate::types::StoreMode;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Immutable snapshot of a run after one step.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub run_id: String,
    pub step: u64,
    /// Node (or comma-joined fan-out group) whose output produced `state`.
    pub node_name: String,
    pub state: ExecutionState,
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        run_id: impl Into<String>,
        step: u64,
        node_name: impl Into<String>,
        state: ExecutionState,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            step,
            node_name: node_name.into(),
            state,
            timestamp: Utc::now(),
        }
    }

    /// Nodes recorded in `node_name`.
    pub fn nodes(&self) -> Vec<&str> {
        self.node_name.split(',').collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunLifecycle {
    Active,
    Suspended,
    Completed,
    Terminated,
}

impl RunLifecycle {
    pub fn as_str(self) -> &'static str {
        match self {
            RunLifecycle::Active => "active",
            RunLifecycle::Suspended => "suspended",
            RunLifecycle::Completed => "completed",
            RunLifecycle::Terminated => "terminated",
        }
    }

    /// `active` covers runs whose driver died mid-flight; they resume from
    /// their last checkpoint like suspended ones.
    pub fn is_resumable(self) -> bool {
        matches!(self, RunLifecycle::Active | RunLifecycle::Suspended)
    }
}

impl fmt::Display for RunLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunLifecycle {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(RunLifecycle::Active),
            "suspended" => Ok(RunLifecycle::Suspended),
            "completed" => Ok(RunLifecycle::Completed),
            "terminated" => Ok(RunLifecycle::Terminated),
            other => Err(format!("unknown run lifecycle: {other}")),
        }
    }
}

/// One row of [`CheckpointStore::list_active`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub summary: String,
    pub latest_step: u64,
    pub latest_node: Option<String>,
    pub lifecycle: RunLifecycle,
    pub updated_at: DateTime<Utc>,
}

/// One row of [`CheckpointStore::history`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub step: u64,
    pub node_name: String,
    pub timestamp: DateTime<Utc>,
}

/// Append-only checkpoint persistence shared by all runs of a process.
///
/// Implementations must make `save` atomic: `load_latest` never observes a
/// partially written checkpoint. `save` rejects a step that is not greater
/// than the latest stored step of the run.
pub trait CheckpointStore: Send + Sync {
    fn register_run(&self, run_id: &str, summary: &str) -> Result<()>;

    fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    fn load_latest(&self, run_id: &str) -> Result<Option<Checkpoint>>;

    /// Runs that are `active` or `suspended`, most recently updated first.
    fn list_active(&self) -> Result<Vec<RunSummary>>;

    fn set_lifecycle(&self, run_id: &str, lifecycle: RunLifecycle) -> Result<()>;

    fn lifecycle(&self, run_id: &str) -> Result<Option<RunLifecycle>>;

    /// Every checkpoint of a run in ascending step order.
    fn history(&self, run_id: &str) -> Result<Vec<HistoryEntry>>;
}

/// Fresh run identifier, e.g. `run_3f9c2a1b`.
pub fn new_run_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("run_{}", &id[..8])
}

/// Open the store selected by `[store]` configuration.
pub fn open_store(mode: StoreMode, path: &Path) -> Result<Arc<dyn CheckpointStore>> {
    Ok(match mode {
        StoreMode::Sqlite => Arc::new(SqliteStore::open(path)?),
        StoreMode::Memory => Arc::new(MemoryStore::new()),
    })
}
