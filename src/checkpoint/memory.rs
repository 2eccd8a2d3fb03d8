// src/checkpoint/memory.rs

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::checkpoint::{Checkpoint, CheckpointStore, HistoryEntry, RunLifecycle, RunSummary};
use crate::errors::{Result, StepflowError};

#[derive(Debug)]
struct RunRecord {
    summary: String,
    lifecycle: RunLifecycle,
    updated_at: DateTime<Utc>,
    checkpoints: Vec<Checkpoint>,
}

impl RunRecord {
    fn new(summary: &str) -> Self {
        Self {
            summary: summary.to_string(),
            lifecycle: RunLifecycle::Active,
            updated_at: Utc::now(),
            checkpoints: Vec::new(),
        }
    }
}

/// Checkpoint store that lives as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    runs: Mutex<HashMap<String, RunRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, RunRecord>>> {
        self.runs
            .lock()
            .map_err(|e| StepflowError::Persistence(format!("memory store poisoned: {e}")))
    }
}

impl CheckpointStore for MemoryStore {
    fn register_run(&self, run_id: &str, summary: &str) -> Result<()> {
        let mut runs = self.lock()?;
        runs.entry(run_id.to_string())
            .or_insert_with(|| RunRecord::new(summary));
        Ok(())
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut runs = self.lock()?;
        let record = runs
            .entry(checkpoint.run_id.clone())
            .or_insert_with(|| RunRecord::new(""));

        match record.checkpoints.last() {
            Some(last) if checkpoint.step <= last.step => {
                return Err(StepflowError::Persistence(format!(
                    "run '{}': step {} is not after latest step {}",
                    checkpoint.run_id, checkpoint.step, last.step
                )));
            }
            _ => {}
        }

        record.updated_at = checkpoint.timestamp;
        record.checkpoints.push(checkpoint.clone());
        Ok(())
    }

    fn load_latest(&self, run_id: &str) -> Result<Option<Checkpoint>> {
        let runs = self.lock()?;
        Ok(runs.get(run_id).and_then(|r| r.checkpoints.last().cloned()))
    }

    fn list_active(&self) -> Result<Vec<RunSummary>> {
        let runs = self.lock()?;
        let mut out: Vec<RunSummary> = runs
            .iter()
            .filter(|(_, r)| r.lifecycle.is_resumable())
            .map(|(id, r)| RunSummary {
                run_id: id.clone(),
                summary: r.summary.clone(),
                latest_step: r.checkpoints.last().map(|c| c.step).unwrap_or(0),
                latest_node: r.checkpoints.last().map(|c| c.node_name.clone()),
                lifecycle: r.lifecycle,
                updated_at: r.updated_at,
            })
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.run_id.cmp(&b.run_id)));
        Ok(out)
    }

    fn set_lifecycle(&self, run_id: &str, lifecycle: RunLifecycle) -> Result<()> {
        let mut runs = self.lock()?;
        let record = runs
            .get_mut(run_id)
            .ok_or_else(|| StepflowError::RunNotFound(run_id.to_string()))?;
        record.lifecycle = lifecycle;
        record.updated_at = Utc::now();
        Ok(())
    }

    fn lifecycle(&self, run_id: &str) -> Result<Option<RunLifecycle>> {
        let runs = self.lock()?;
        Ok(runs.get(run_id).map(|r| r.lifecycle))
    }

    fn history(&self, run_id: &str) -> Result<Vec<HistoryEntry>> {
        let runs = self.lock()?;
        Ok(runs
            .get(run_id)
            .map(|r| {
                r.checkpoints
                    .iter()
                    .map(|c| HistoryEntry {
                        step: c.step,
                        node_name: c.node_name.clone(),
                        timestamp: c.timestamp,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}
