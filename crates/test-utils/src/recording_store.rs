use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use stepflow::checkpoint::{
    Checkpoint, CheckpointStore, HistoryEntry, MemoryStore, RunLifecycle, RunSummary,
};
use stepflow::errors::{Result, StepflowError};

/// A checkpoint store that:
/// - delegates to a [`MemoryStore`]
/// - records every attempted save as `(step, node_name)`
/// - can be told to fail saves, to exercise persistence-failure handling.
#[derive(Debug, Default)]
pub struct RecordingStore {
    inner: MemoryStore,
    saves: Mutex<Vec<(u64, String)>>,
    fail_saves: AtomicBool,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn saves(&self) -> Vec<(u64, String)> {
        self.saves.lock().unwrap().clone()
    }

    pub fn steps(&self) -> Vec<u64> {
        self.saves().into_iter().map(|(s, _)| s).collect()
    }
}

impl CheckpointStore for RecordingStore {
    fn register_run(&self, run_id: &str, summary: &str) -> Result<()> {
        self.inner.register_run(run_id, summary)
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.saves
            .lock()
            .unwrap()
            .push((checkpoint.step, checkpoint.node_name.clone()));
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StepflowError::Persistence("disk full (simulated)".to_string()));
        }
        self.inner.save(checkpoint)
    }

    fn load_latest(&self, run_id: &str) -> Result<Option<Checkpoint>> {
        self.inner.load_latest(run_id)
    }

    fn list_active(&self) -> Result<Vec<RunSummary>> {
        self.inner.list_active()
    }

    fn set_lifecycle(&self, run_id: &str, lifecycle: RunLifecycle) -> Result<()> {
        self.inner.set_lifecycle(run_id, lifecycle)
    }

    fn lifecycle(&self, run_id: &str) -> Result<Option<RunLifecycle>> {
        self.inner.lifecycle(run_id)
    }

    fn history(&self, run_id: &str) -> Result<Vec<HistoryEntry>> {
        self.inner.history(run_id)
    }
}
