// src/checkpoint/sqlite.rs

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::checkpoint::{Checkpoint, CheckpointStore, HistoryEntry, RunLifecycle, RunSummary};
use crate::errors::{Result, StepflowError};
use crate::state::ExecutionState;

/// Durable checkpoint store backed by SQLite.
///
/// Each `save` runs in its own transaction, so a reader never sees half of a
/// checkpoint. `UNIQUE(run_id, step)` backs up the monotonicity check.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the checkpoint database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        Self::init(conn, Some(path))
    }

    /// Database that disappears with the process; handy in tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<&Path>) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS runs (
                 run_id TEXT PRIMARY KEY,
                 summary TEXT NOT NULL,
                 lifecycle TEXT NOT NULL,
                 created_at TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS checkpoints (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 run_id TEXT NOT NULL,
                 step INTEGER NOT NULL,
                 node_name TEXT NOT NULL,
                 state_json TEXT NOT NULL,
                 timestamp TEXT NOT NULL,
                 UNIQUE(run_id, step)
             );

             CREATE INDEX IF NOT EXISTS idx_cp_run_step
                 ON checkpoints(run_id, step DESC);
             CREATE INDEX IF NOT EXISTS idx_runs_lifecycle
                 ON runs(lifecycle);",
        )?;

        debug!(path = ?path, "checkpoint database ready");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StepflowError::Persistence(format!("checkpoint connection poisoned: {e}")))
    }
}

fn ts(t: &DateTime<Utc>) -> String {
    // Fixed width keeps lexical order equal to chronological order.
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_lifecycle(s: &str) -> Result<RunLifecycle> {
    s.parse().map_err(StepflowError::Persistence)
}

impl CheckpointStore for SqliteStore {
    fn register_run(&self, run_id: &str, summary: &str) -> Result<()> {
        let conn = self.lock()?;
        let now = ts(&Utc::now());
        conn.execute(
            "INSERT OR IGNORE INTO runs (run_id, summary, lifecycle, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![run_id, summary, RunLifecycle::Active.as_str(), now],
        )?;
        Ok(())
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let state_json = checkpoint.state.to_json()?;
        let stamp = ts(&checkpoint.timestamp);

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let latest: Option<i64> = tx.query_row(
            "SELECT MAX(step) FROM checkpoints WHERE run_id = ?1",
            params![checkpoint.run_id],
            |row| row.get(0),
        )?;
        if let Some(latest) = latest {
            if checkpoint.step as i64 <= latest {
                return Err(StepflowError::Persistence(format!(
                    "run '{}': step {} is not after latest step {}",
                    checkpoint.run_id, checkpoint.step, latest
                )));
            }
        }

        tx.execute(
            "INSERT INTO checkpoints (run_id, step, node_name, state_json, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                checkpoint.run_id,
                checkpoint.step as i64,
                checkpoint.node_name,
                state_json,
                stamp,
            ],
        )?;
        tx.execute(
            "INSERT INTO runs (run_id, summary, lifecycle, created_at, updated_at)
             VALUES (?1, '', ?2, ?3, ?3)
             ON CONFLICT(run_id) DO UPDATE SET updated_at = excluded.updated_at",
            params![checkpoint.run_id, RunLifecycle::Active.as_str(), stamp],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn load_latest(&self, run_id: &str) -> Result<Option<Checkpoint>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT step, node_name, state_json, timestamp
                 FROM checkpoints
                 WHERE run_id = ?1
                 ORDER BY step DESC
                 LIMIT 1",
                params![run_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((step, node_name, state_json, stamp)) = row else {
            return Ok(None);
        };

        Ok(Some(Checkpoint {
            run_id: run_id.to_string(),
            step: step as u64,
            node_name,
            state: ExecutionState::from_json(&state_json)?,
            timestamp: parse_ts(&stamp),
        }))
    }

    fn list_active(&self) -> Result<Vec<RunSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT r.run_id, r.summary, r.lifecycle, r.updated_at,
                    (SELECT MAX(c.step) FROM checkpoints c WHERE c.run_id = r.run_id),
                    (SELECT c.node_name FROM checkpoints c WHERE c.run_id = r.run_id
                     ORDER BY c.step DESC LIMIT 1)
             FROM runs r
             WHERE r.lifecycle IN ('active', 'suspended')
             ORDER BY r.updated_at DESC, r.rowid DESC",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(run_id, summary, lifecycle, updated_at, step, node)| {
                Ok(RunSummary {
                    run_id,
                    summary,
                    latest_step: step.unwrap_or(0) as u64,
                    latest_node: node,
                    lifecycle: parse_lifecycle(&lifecycle)?,
                    updated_at: parse_ts(&updated_at),
                })
            })
            .collect()
    }

    fn set_lifecycle(&self, run_id: &str, lifecycle: RunLifecycle) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE runs SET lifecycle = ?2, updated_at = ?3 WHERE run_id = ?1",
            params![run_id, lifecycle.as_str(), ts(&Utc::now())],
        )?;
        if changed == 0 {
            return Err(StepflowError::RunNotFound(run_id.to_string()));
        }
        Ok(())
    }

    fn lifecycle(&self, run_id: &str) -> Result<Option<RunLifecycle>> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT lifecycle FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        raw.as_deref().map(parse_lifecycle).transpose()
    }

    fn history(&self, run_id: &str) -> Result<Vec<HistoryEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT step, node_name, timestamp FROM checkpoints
             WHERE run_id = ?1 ORDER BY step ASC",
        )?;
        let entries = stmt
            .query_map(params![run_id], |row| {
                let stamp: String = row.get(2)?;
                Ok(HistoryEntry {
                    step: row.get::<_, i64>(0)? as u64,
                    node_name: row.get(1)?,
                    timestamp: parse_ts(&stamp),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}
