// src/engine/mod.rs

//! Execution engine for stepflow.
//!
//! This module ties together:
//! - the graph (which node runs next)
//! - the state merge model (how outputs are folded into the run state)
//! - the checkpoint store (what is persisted after every step)
//! - suspension and resume (where a run waits for external input)
//!
//! Routing decisions live in the pure [`core`]; concurrent branch execution
//! lives in [`fanout`]; the async driver is implemented in [`runtime`].

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::config::ConfigFile;
use crate::state::{ExecutionState, Message, Patch, Phase};

/// Options that bound a single drive of a run.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Steps one `start` or `resume` call may execute before the run is
    /// terminated.
    pub max_steps: u64,
    pub branch_timeout: Duration,
    pub fanout_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_steps: 100,
            branch_timeout: Duration::from_secs(30),
            fanout_timeout: Duration::from_secs(60),
        }
    }
}

impl From<&ConfigFile> for EngineOptions {
    fn from(cfg: &ConfigFile) -> Self {
        Self {
            max_steps: cfg.engine.max_steps,
            branch_timeout: Duration::from_millis(cfg.engine.branch_timeout_ms),
            fanout_timeout: Duration::from_millis(cfg.engine.fanout_timeout_ms),
        }
    }
}

/// External input supplied when a suspended run continues.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResumeInput {
    /// Appended to `messages` as a user message.
    pub message: Option<String>,
    /// Stored under `control.values["decision"]`.
    pub decision: Option<String>,
    /// Extra data keys to overwrite.
    pub data: BTreeMap<String, Value>,
    /// Explicit status to resume with; defaults to `processing`.
    pub status: Option<Phase>,
}

impl ResumeInput {
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            message: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn decision(value: impl Into<String>) -> Self {
        Self {
            decision: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn into_patch(self) -> Patch {
        let mut patch = Patch::new();
        if let Some(text) = self.message {
            patch = patch.message(Message::user(text));
        }
        if let Some(decision) = self.decision {
            patch = patch.control_value("decision", decision);
        }
        patch.data.extend(self.data);
        patch.status = self.status;
        patch
    }
}

/// Progress notification emitted after every persisted step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepUpdate {
    pub run_id: String,
    pub step: u64,
    pub nodes: Vec<String>,
    pub status: Phase,
    /// Latest assistant-facing message, if any.
    pub message: Option<String>,
}

/// One entry of the state stream returned by `start` and `resume`.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub step: u64,
    pub nodes: Vec<String>,
    pub state: ExecutionState,
}

pub mod core;
pub mod fanout;
pub mod runtime;

pub use fanout::{FanOutCoordinator, FanOutOutcome};
pub use runtime::{Engine, InputFuture, InputSource, RunReport};
