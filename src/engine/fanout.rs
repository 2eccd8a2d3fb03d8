// src/engine/fanout.rs

//! Fan-out / fan-in coordination.
//!
//! Every branch of a group runs as its own Tokio task against the same
//! read-only snapshot of the pre-step state. The coordinator only returns
//! once each branch has produced a patch or been replaced by its fallback,
//! so the join never sees a partial group.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::StepflowError;
use crate::graph::{GraphSpec, NodeContext};
use crate::state::{BranchPatch, ExecutionState, Message, Patch};

/// Why a branch did not produce its own patch.
#[derive(Debug)]
enum BranchError {
    Failed(anyhow::Error),
    Panicked,
    TimedOut,
    Cancelled,
}

/// Merged-ready result of one fan-out group.
#[derive(Debug, Default)]
pub struct FanOutOutcome {
    /// One patch per branch, fallbacks included, tagged with declaration order.
    pub patches: Vec<BranchPatch>,
    /// Branches that were replaced by a fallback.
    pub failures: Vec<StepflowError>,
}

#[derive(Debug, Clone, Copy)]
pub struct FanOutCoordinator {
    branch_timeout: Duration,
    group_timeout: Duration,
}

impl FanOutCoordinator {
    pub fn new(branch_timeout: Duration, group_timeout: Duration) -> Self {
        Self {
            branch_timeout,
            group_timeout,
        }
    }

    pub async fn run(
        &self,
        spec: &GraphSpec,
        state: &ExecutionState,
        branches: &[String],
        run_id: &str,
        step: u64,
        parent: &CancellationToken,
    ) -> FanOutOutcome {
        let snapshot = Arc::new(state.clone());
        let group_token = parent.child_token();
        let mut set = JoinSet::new();
        let mut slot_of = HashMap::new();

        info!(run_id, step, ?branches, "fan-out started");

        for (slot, name) in branches.iter().enumerate() {
            let Some(entry) = spec.node(name) else {
                // Unreachable for a validated graph; left as a failed slot.
                warn!(branch = %name, "fan-out branch is not declared");
                continue;
            };
            let handler = entry.handler.clone();
            let snapshot = snapshot.clone();
            let mut ctx = NodeContext::new(run_id, name.clone(), step);
            ctx.cancel = group_token.child_token();
            let branch_timeout = self.branch_timeout;

            let task = set.spawn(async move {
                let token = ctx.cancel.clone();
                let result = tokio::select! {
                    _ = token.cancelled() => Err(BranchError::Cancelled),
                    r = tokio::time::timeout(branch_timeout, handler.run(&snapshot, &ctx)) => match r {
                        Ok(Ok(patch)) => Ok(patch),
                        Ok(Err(e)) => Err(BranchError::Failed(e)),
                        Err(_) => {
                            token.cancel();
                            Err(BranchError::TimedOut)
                        }
                    },
                };
                (slot, result)
            });
            slot_of.insert(task.id(), slot);
        }

        let mut results: Vec<Option<Result<Patch, BranchError>>> =
            (0..branches.len()).map(|_| None).collect();
        let deadline = Instant::now() + self.group_timeout;

        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok((slot, result)))) => {
                    debug!(branch = %branches[slot], ok = result.is_ok(), "branch finished");
                    results[slot] = Some(result);
                }
                Ok(Some(Err(join_err))) => {
                    warn!(error = %join_err, "fan-out branch task failed");
                    if let Some(&slot) = slot_of.get(&join_err.id()) {
                        results[slot] = Some(Err(BranchError::Panicked));
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        run_id,
                        step,
                        timeout_ms = self.group_timeout.as_millis() as u64,
                        "fan-out group timed out; cancelling outstanding branches"
                    );
                    group_token.cancel();
                    set.abort_all();
                    break;
                }
            }
        }

        let mut outcome = FanOutOutcome::default();
        for (slot, (name, result)) in branches.iter().zip(results).enumerate() {
            let order = spec.node(name).map(|n| n.order).unwrap_or(slot);
            let patch = match result {
                Some(Ok(patch)) => patch,
                Some(Err(BranchError::Failed(e))) => {
                    let err = StepflowError::Handler {
                        node: name.clone(),
                        message: format!("{e:#}"),
                    };
                    self.degrade(spec, name, err, &mut outcome)
                }
                Some(Err(BranchError::Panicked)) => {
                    let err = StepflowError::Handler {
                        node: name.clone(),
                        message: "panicked".to_string(),
                    };
                    self.degrade(spec, name, err, &mut outcome)
                }
                Some(Err(BranchError::TimedOut | BranchError::Cancelled)) | None => {
                    let err = StepflowError::Timeout { node: name.clone() };
                    self.degrade(spec, name, err, &mut outcome)
                }
            };
            outcome.patches.push(BranchPatch {
                order,
                node: name.clone(),
                patch,
            });
        }

        info!(
            run_id,
            step,
            failed = outcome.failures.len(),
            "fan-out joined"
        );
        outcome
    }

    /// Fallback patch for a branch, recording why it was used.
    fn degrade(
        &self,
        spec: &GraphSpec,
        node: &str,
        err: StepflowError,
        outcome: &mut FanOutOutcome,
    ) -> Patch {
        warn!(branch = node, error = %err, "using fallback patch for branch");
        let fallback = spec
            .node(node)
            .and_then(|n| n.fallback.clone())
            .unwrap_or_default();
        let patch = fallback
            .set(format!("{node}_error"), err.to_string())
            .message(Message::system(format!(
                "{err}; continuing with fallback values"
            )));
        outcome.failures.push(err);
        patch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{async_handler, handler_fn, GraphBuilder, NodeHandler};
    use serde_json::json;

    fn group_spec(slow: Arc<dyn NodeHandler>) -> GraphSpec {
        GraphBuilder::new()
            .add_node("src", handler_fn(|_| Ok(Patch::new())))
            .add_node("fast", handler_fn(|_| Ok(Patch::new().set("fast", 1))))
            .add_node_with_fallback("slow", slow, Patch::new().set("slow", "unavailable"))
            .add_node("join", handler_fn(|_| Ok(Patch::new())))
            .add_edge("src", "fast")
            .add_edge("src", "slow")
            .add_edge("fast", "join")
            .add_edge("slow", "join")
            .set_entry("src")
            .build()
            .unwrap()
    }

    fn branches() -> Vec<String> {
        vec!["fast".to_string(), "slow".to_string()]
    }

    #[tokio::test]
    async fn collects_every_branch() {
        let spec = group_spec(handler_fn(|_| Ok(Patch::new().set("slow", 2))));
        let coordinator = FanOutCoordinator::new(Duration::from_secs(1), Duration::from_secs(2));
        let outcome = coordinator
            .run(&spec, &ExecutionState::new(), &branches(), "run_t", 1, &CancellationToken::new())
            .await;

        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.patches.len(), 2);
        assert_eq!(outcome.patches[1].patch.data.get("slow"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn branch_timeout_uses_fallback() {
        let slow = async_handler(|_, _| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Patch::new().set("slow", "late"))
        });
        let spec = group_spec(slow);
        let coordinator =
            FanOutCoordinator::new(Duration::from_millis(50), Duration::from_secs(5));
        let outcome = coordinator
            .run(&spec, &ExecutionState::new(), &branches(), "run_t", 1, &CancellationToken::new())
            .await;

        assert_eq!(outcome.failures.len(), 1);
        assert!(matches!(outcome.failures[0], StepflowError::Timeout { ref node } if node == "slow"));
        let slow = &outcome.patches[1].patch;
        assert_eq!(slow.data.get("slow"), Some(&json!("unavailable")));
        assert!(slow.data.contains_key("slow_error"));
        assert_eq!(outcome.patches[0].patch.data.get("fast"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn group_timeout_cancels_outstanding_branches() {
        let slow = async_handler(|_, ctx: NodeContext| async move {
            ctx.cancel.cancelled().await;
            Ok(Patch::new().set("slow", "cancelled-but-returned"))
        });
        let spec = group_spec(slow);
        let coordinator =
            FanOutCoordinator::new(Duration::from_secs(60), Duration::from_millis(100));
        let outcome = coordinator
            .run(&spec, &ExecutionState::new(), &branches(), "run_t", 1, &CancellationToken::new())
            .await;

        assert_eq!(outcome.patches.len(), 2);
        assert_eq!(
            outcome.patches[1].patch.data.get("slow"),
            Some(&json!("unavailable"))
        );
    }

    #[tokio::test]
    async fn panicking_branch_is_a_handler_failure() {
        let boom = async_handler(|_, _| async {
            if true {
                panic!("index out of range");
            }
            Ok(Patch::new())
        });
        let spec = group_spec(boom);
        let coordinator = FanOutCoordinator::new(Duration::from_secs(1), Duration::from_secs(2));
        let outcome = coordinator
            .run(&spec, &ExecutionState::new(), &branches(), "run_t", 1, &CancellationToken::new())
            .await;

        assert_eq!(outcome.failures.len(), 1);
        assert!(matches!(
            outcome.failures[0],
            StepflowError::Handler { ref node, ref message } if node == "slow" && message == "panicked"
        ));
        assert_eq!(
            outcome.patches[1].patch.data.get("slow"),
            Some(&json!("unavailable"))
        );
    }

    #[tokio::test]
    async fn failing_branch_is_isolated() {
        let spec = group_spec(handler_fn(|_| anyhow::bail!("lookup service down")));
        let coordinator = FanOutCoordinator::new(Duration::from_secs(1), Duration::from_secs(2));
        let outcome = coordinator
            .run(&spec, &ExecutionState::new(), &branches(), "run_t", 1, &CancellationToken::new())
            .await;

        assert_eq!(outcome.patches[0].patch.data.get("fast"), Some(&json!(1)));
        let err = outcome.patches[1].patch.data.get("slow_error").unwrap();
        assert!(err.as_str().unwrap().contains("lookup service down"));
        assert!(matches!(outcome.failures[0], StepflowError::Handler { .. }));
    }
}
