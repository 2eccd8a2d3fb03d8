// src/state/model.rs

//! Typed execution state shared by every node of a run.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Author of a message in the run's conversation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One entry of the append-only `messages` log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// Run phase stored in `status` and read by routers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Processing,
    Planning,
    Continuing,
    Optimizing,
    CollectingInfo,
    WaitingConfirmation,
    Completed,
    Terminated,
}

/// How the driver treats a [`Phase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseClass {
    /// The driver keeps scheduling nodes.
    Runnable,
    /// The run suspends until external input arrives.
    AwaitingInput,
    /// No further step ever executes.
    Terminal,
}

impl Phase {
    pub fn class(self) -> PhaseClass {
        match self {
            Phase::Processing | Phase::Planning | Phase::Continuing | Phase::Optimizing => {
                PhaseClass::Runnable
            }
            Phase::CollectingInfo | Phase::WaitingConfirmation => PhaseClass::AwaitingInput,
            Phase::Completed | Phase::Terminated => PhaseClass::Terminal,
        }
    }

    pub fn is_runnable(self) -> bool {
        self.class() == PhaseClass::Runnable
    }

    pub fn awaits_input(self) -> bool {
        self.class() == PhaseClass::AwaitingInput
    }

    pub fn is_terminal(self) -> bool {
        self.class() == PhaseClass::Terminal
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Processing => "processing",
            Phase::Planning => "planning",
            Phase::Continuing => "continuing",
            Phase::Optimizing => "optimizing",
            Phase::CollectingInfo => "collecting_info",
            Phase::WaitingConfirmation => "waiting_confirmation",
            Phase::Completed => "completed",
            Phase::Terminated => "terminated",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "processing" => Ok(Phase::Processing),
            "planning" => Ok(Phase::Planning),
            "continuing" => Ok(Phase::Continuing),
            "optimizing" => Ok(Phase::Optimizing),
            "collecting_info" => Ok(Phase::CollectingInfo),
            "waiting_confirmation" => Ok(Phase::WaitingConfirmation),
            "completed" => Ok(Phase::Completed),
            "terminated" => Ok(Phase::Terminated),
            other => Err(format!("unknown phase: {other}")),
        }
    }
}

/// Engine-visible bookkeeping kept under `control`.
///
/// Attempt counters never decrease and flags that became `true` stay `true`
/// unless a patch clears them explicitly; both rules are enforced when a
/// patch is applied (see [`crate::state::merge`]).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ControlBlock {
    #[serde(default)]
    pub attempts: BTreeMap<String, u32>,
    #[serde(default)]
    pub flags: BTreeMap<String, bool>,
    #[serde(default)]
    pub interactive: bool,
    /// Arbitrary handler-defined keys.
    #[serde(default)]
    pub values: BTreeMap<String, Value>,
}

impl ControlBlock {
    pub fn attempts(&self, loop_name: &str) -> u32 {
        self.attempts.get(loop_name).copied().unwrap_or(0)
    }

    pub fn flag(&self, name: &str) -> bool {
        self.flags.get(name).copied().unwrap_or(false)
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}

/// The shared state of a run: reserved fields plus an open data map.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionState {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub control: ControlBlock,
    #[serde(default)]
    pub status: Phase,
    /// Domain data written by node handlers, overwritten per key.
    #[serde(default)]
    pub data: BTreeMap<String, Value>,
}

impl ExecutionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initial state for a free-text request.
    pub fn from_request(request: impl Into<String>, interactive: bool) -> Self {
        let mut state = Self::new();
        state.messages.push(Message::user(request));
        state.control.interactive = interactive;
        state
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Deserialize a data field into a concrete type.
    ///
    /// Returns `None` when the key is absent or has an incompatible shape.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn last_message(&self, role: Role) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == role)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
