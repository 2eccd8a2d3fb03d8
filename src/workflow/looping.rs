// src/workflow/looping.rs

//! Bounded optimisation loops.
//!
//! A loop is two nodes: a work node that performs one pass and bumps
//! `control.attempts[name]`, and a check node whose conditional edge asks
//! [`LoopPolicy::decide`] whether to go round again, advance to the next
//! stage, or escalate. The policy never continues once `max_attempts` is
//! reached, so a loop runs at most `max_attempts` passes.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::graph::{handler_fn, GraphBuilder, NodeHandler, Router, Target};
use crate::state::{ExecutionState, Patch};

pub const CONTINUE: &str = "continue";
pub const ADVANCE: &str = "advance";
pub const ESCALATE: &str = "escalate";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopDecision {
    Continue,
    Advance,
    Escalate,
}

impl LoopDecision {
    pub fn as_key(self) -> &'static str {
        match self {
            LoopDecision::Continue => CONTINUE,
            LoopDecision::Advance => ADVANCE,
            LoopDecision::Escalate => ESCALATE,
        }
    }
}

impl fmt::Display for LoopDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_key())
    }
}

type Predicate = dyn Fn(&ExecutionState) -> bool + Send + Sync;

/// Continue / advance / escalate policy for one named loop.
#[derive(Clone)]
pub struct LoopPolicy {
    name: String,
    max_attempts: u32,
    satisfied_flag: String,
    escalate_flag: String,
    still_failing: Arc<Predicate>,
}

impl fmt::Debug for LoopPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopPolicy")
            .field("name", &self.name)
            .field("max_attempts", &self.max_attempts)
            .field("satisfied_flag", &self.satisfied_flag)
            .field("escalate_flag", &self.escalate_flag)
            .finish_non_exhaustive()
    }
}

impl LoopPolicy {
    /// Policy with flags `{name}_satisfied` / `{name}_escalate`.
    ///
    /// Without a custom predicate an exhausted, unsatisfied loop escalates.
    pub fn new(name: impl Into<String>, max_attempts: u32) -> Self {
        let name = name.into();
        Self {
            satisfied_flag: format!("{name}_satisfied"),
            escalate_flag: format!("{name}_escalate"),
            name,
            max_attempts: max_attempts.max(1),
            still_failing: Arc::new(|_| true),
        }
    }

    /// Quality/cost check consulted once the attempts are used up: `true`
    /// escalates, `false` advances anyway.
    pub fn with_failure_predicate<F>(mut self, f: F) -> Self
    where
        F: Fn(&ExecutionState) -> bool + Send + Sync + 'static,
    {
        self.still_failing = Arc::new(f);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn satisfied_flag(&self) -> &str {
        &self.satisfied_flag
    }

    pub fn escalate_flag(&self) -> &str {
        &self.escalate_flag
    }

    pub fn attempts(&self, state: &ExecutionState) -> u32 {
        state.control.attempts(&self.name)
    }

    /// Patch a work node merges to record one more pass.
    pub fn bump(&self, state: &ExecutionState) -> Patch {
        Patch::new().attempts(self.name.clone(), self.attempts(state) + 1)
    }

    pub fn decide(&self, state: &ExecutionState) -> LoopDecision {
        let attempts = self.attempts(state);
        let exhausted = attempts >= self.max_attempts;

        let decision = if state.control.flag(&self.satisfied_flag) {
            LoopDecision::Advance
        } else if state.control.flag(&self.escalate_flag)
            || (exhausted && (self.still_failing)(state))
        {
            LoopDecision::Escalate
        } else if exhausted {
            LoopDecision::Advance
        } else {
            LoopDecision::Continue
        };

        debug!(
            loop_name = %self.name,
            attempts,
            max = self.max_attempts,
            %decision,
            "loop decision"
        );
        decision
    }

    pub fn router(&self) -> Router {
        let policy = self.clone();
        Router::new([CONTINUE, ADVANCE, ESCALATE], move |state: &ExecutionState| {
            Ok(policy.decide(state).as_key().to_string())
        })
    }

    /// Pass-through check node that records the latest decision under
    /// `control.values["{name}_decision"]`.
    pub fn check_node(&self) -> Arc<dyn NodeHandler> {
        let policy = self.clone();
        handler_fn(move |state| {
            let decision = policy.decide(state);
            Ok(Patch::new().control_value(format!("{}_decision", policy.name), decision.as_key()))
        })
    }
}

impl GraphBuilder {
    /// Wire `work -> check` and the check node's three-way conditional edge.
    ///
    /// Both nodes must be declared separately; `check` usually uses
    /// [`LoopPolicy::check_node`].
    pub fn add_loop(
        self,
        policy: &LoopPolicy,
        work: &str,
        check: &str,
        advance: Target,
        escalate: Target,
    ) -> Self {
        self.add_edge(work, check).add_conditional_edge(
            check,
            policy.router(),
            [
                (CONTINUE, Target::node(work)),
                (ADVANCE, advance),
                (ESCALATE, escalate),
            ],
        )
    }
}
