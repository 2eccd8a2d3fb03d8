// src/state/merge.rs

//! Patches returned by node handlers and the rules for folding them into
//! an [`ExecutionState`].
//!
//! - `messages` is additive: patches append, never replace.
//! - `control.attempts` only moves forward (a lower value is ignored).
//! - `control.flags` stay `true` once set, unless cleared explicitly.
//! - `status`, `control.interactive`, `control.values.*` and every data key
//!   are overwritten.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::state::model::{ControlBlock, ExecutionState, Message, Phase};

/// Changes to the `control` namespace.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ControlPatch {
    pub attempts: BTreeMap<String, u32>,
    pub flags: BTreeMap<String, bool>,
    /// Flags removed before `flags` is applied.
    pub cleared_flags: Vec<String>,
    pub interactive: Option<bool>,
    pub values: BTreeMap<String, Value>,
}

impl ControlPatch {
    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
            && self.flags.is_empty()
            && self.cleared_flags.is_empty()
            && self.interactive.is_none()
            && self.values.is_empty()
    }
}

/// Output of one node invocation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Patch {
    pub messages: Vec<Message>,
    pub control: ControlPatch,
    pub status: Option<Phase>,
    pub data: BTreeMap<String, Value>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.control.is_empty()
            && self.status.is_none()
            && self.data.is_empty()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    /// Append an assistant-facing message.
    pub fn say(self, content: impl Into<String>) -> Self {
        self.message(Message::assistant(content))
    }

    pub fn status(mut self, status: Phase) -> Self {
        self.status = Some(status);
        self
    }

    pub fn attempts(mut self, loop_name: impl Into<String>, value: u32) -> Self {
        self.control.attempts.insert(loop_name.into(), value);
        self
    }

    pub fn flag(mut self, name: impl Into<String>, value: bool) -> Self {
        self.control.flags.insert(name.into(), value);
        self
    }

    pub fn clear_flag(mut self, name: impl Into<String>) -> Self {
        self.control.cleared_flags.push(name.into());
        self
    }

    pub fn interactive(mut self, value: bool) -> Self {
        self.control.interactive = Some(value);
        self
    }

    pub fn control_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.control.values.insert(key.into(), value.into());
        self
    }

    /// Names of the overwrite-merged keys this patch writes.
    ///
    /// Additive and monotonic fields (messages, attempts, flags) are left out
    /// because concurrent writes to them cannot conflict.
    pub fn written_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.keys().cloned().collect();
        if self.status.is_some() {
            keys.push("status".to_string());
        }
        if self.control.interactive.is_some() {
            keys.push("control.interactive".to_string());
        }
        keys.extend(self.control.values.keys().map(|k| format!("control.values.{k}")));
        keys
    }
}

impl ControlBlock {
    fn apply(&mut self, patch: ControlPatch) {
        for name in patch.cleared_flags {
            if self.flags.remove(&name).is_some() {
                debug!(flag = %name, "control flag cleared");
            }
        }

        for (name, proposed) in patch.attempts {
            let current = self.attempts.entry(name.clone()).or_insert(0);
            if proposed < *current {
                warn!(
                    loop_name = %name,
                    current = *current,
                    proposed,
                    "ignoring attempt counter decrease"
                );
            } else {
                *current = proposed;
            }
        }

        for (name, value) in patch.flags {
            if !value && self.flag(&name) {
                warn!(flag = %name, "ignoring silent reset of a set control flag");
                continue;
            }
            self.flags.insert(name, value);
        }

        if let Some(interactive) = patch.interactive {
            self.interactive = interactive;
        }

        self.values.extend(patch.values);
    }
}

impl ExecutionState {
    /// Fold a single patch into this state.
    pub fn apply(&mut self, patch: Patch) {
        self.messages.extend(patch.messages);
        self.control.apply(patch.control);
        if let Some(status) = patch.status {
            self.status = status;
        }
        self.data.extend(patch.data);
    }
}

/// Patch produced by one member of a fan-out group.
#[derive(Debug, Clone)]
pub struct BranchPatch {
    /// Declaration index of the branch node in the graph.
    pub order: usize,
    pub node: String,
    pub patch: Patch,
}

/// Two or more branches of one fan-out group wrote the same key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeConflict {
    pub key: String,
    /// Branch whose value was kept (highest declaration index).
    pub winner: String,
    pub overridden: Vec<String>,
}

/// Merge the patches of a fan-out group into `state`.
///
/// Patches are applied in ascending declaration order regardless of the
/// order in which the branches finished, so the result only depends on the
/// set of patches. A key written by several branches keeps the value of the
/// branch declared last; every such key is returned as a [`MergeConflict`].
pub fn merge_fanout(state: &mut ExecutionState, mut patches: Vec<BranchPatch>) -> Vec<MergeConflict> {
    patches.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.node.cmp(&b.node)));

    let mut writers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for branch in &patches {
        for key in branch.patch.written_keys() {
            writers.entry(key).or_default().push(branch.node.clone());
        }
    }

    let conflicts: Vec<MergeConflict> = writers
        .into_iter()
        .filter(|(_, nodes)| nodes.len() > 1)
        .map(|(key, mut nodes)| {
            let winner = nodes.pop().unwrap_or_default();
            MergeConflict {
                key,
                winner,
                overridden: nodes,
            }
        })
        .collect();

    for conflict in &conflicts {
        warn!(
            key = %conflict.key,
            winner = %conflict.winner,
            overridden = ?conflict.overridden,
            "fan-out branches wrote the same key; later-declared branch wins"
        );
    }

    for branch in patches {
        state.apply(branch.patch);
    }

    conflicts
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn messages_are_appended() {
        let mut state = ExecutionState::from_request("hi", false);
        state.apply(Patch::new().say("hello"));
        state.apply(Patch::new().say("again"));
        let contents: Vec<_> = state.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["hi", "hello", "again"]);
    }

    #[test]
    fn data_keys_are_overwritten() {
        let mut state = ExecutionState::new();
        state.apply(Patch::new().set("a", 1).set("b", 2));
        state.apply(Patch::new().set("a", 10));
        assert_eq!(state.get("a"), Some(&json!(10)));
        assert_eq!(state.get("b"), Some(&json!(2)));
    }

    #[test]
    fn attempts_never_decrease() {
        let mut state = ExecutionState::new();
        state.apply(Patch::new().attempts("budget", 2));
        state.apply(Patch::new().attempts("budget", 1));
        assert_eq!(state.control.attempts("budget"), 2);
        state.apply(Patch::new().attempts("budget", 3));
        assert_eq!(state.control.attempts("budget"), 3);
    }

    #[test]
    fn set_flags_are_sticky_unless_cleared() {
        let mut state = ExecutionState::new();
        state.apply(Patch::new().flag("satisfied", true));
        state.apply(Patch::new().flag("satisfied", false));
        assert!(state.control.flag("satisfied"));

        state.apply(Patch::new().clear_flag("satisfied"));
        assert!(!state.control.flag("satisfied"));

        state.apply(Patch::new().flag("escalate", false));
        state.apply(Patch::new().flag("escalate", true));
        assert!(state.control.flag("escalate"));
    }

    #[test]
    fn status_is_only_written_when_present() {
        let mut state = ExecutionState::new();
        state.apply(Patch::new().status(Phase::Planning));
        state.apply(Patch::new().set("x", 1));
        assert_eq!(state.status, Phase::Planning);
    }

    #[test]
    fn fanout_distinct_keys_have_no_conflicts() {
        let mut state = ExecutionState::new();
        let conflicts = merge_fanout(
            &mut state,
            vec![
                BranchPatch { order: 2, node: "b".into(), patch: Patch::new().set("b", 2) },
                BranchPatch { order: 1, node: "a".into(), patch: Patch::new().set("a", 1) },
            ],
        );
        assert!(conflicts.is_empty());
        assert_eq!(state.get("a"), Some(&json!(1)));
        assert_eq!(state.get("b"), Some(&json!(2)));
    }

    #[test]
    fn fanout_shared_key_prefers_later_declaration() {
        let mut state = ExecutionState::new();
        let conflicts = merge_fanout(
            &mut state,
            vec![
                BranchPatch { order: 5, node: "late".into(), patch: Patch::new().set("price", 2) },
                BranchPatch { order: 3, node: "early".into(), patch: Patch::new().set("price", 1) },
            ],
        );
        assert_eq!(state.get("price"), Some(&json!(2)));
        assert_eq!(
            conflicts,
            vec![MergeConflict {
                key: "price".into(),
                winner: "late".into(),
                overridden: vec!["early".into()],
            }]
        );
    }

    #[test]
    fn fanout_messages_follow_declaration_order() {
        let mut state = ExecutionState::new();
        merge_fanout(
            &mut state,
            vec![
                BranchPatch { order: 1, node: "hotels".into(), patch: Patch::new().say("hotels") },
                BranchPatch { order: 0, node: "flights".into(), patch: Patch::new().say("flights") },
            ],
        );
        let contents: Vec<_> = state.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["flights", "hotels"]);
    }
}
