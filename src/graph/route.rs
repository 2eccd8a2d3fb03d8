// src/graph/route.rs

//! Conditional routing primitives.

use std::fmt;
use std::sync::Arc;

use crate::state::ExecutionState;

/// Reserved target name meaning "no next node".
///
/// Whether reaching it suspends, completes or terminates the run depends on
/// the state's `status` at that point.
pub const END: &str = "__end__";

type RouteFn = dyn Fn(&ExecutionState) -> anyhow::Result<String> + Send + Sync;

/// A router attached to a conditional edge.
///
/// The router declares every key it may return; `GraphBuilder::build`
/// checks that the edge's target map covers all of them.
#[derive(Clone)]
pub struct Router {
    keys: Vec<String>,
    func: Arc<RouteFn>,
}

impl Router {
    pub fn new<I, S, F>(keys: I, func: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&ExecutionState) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            func: Arc::new(func),
        }
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn route(&self, state: &ExecutionState) -> anyhow::Result<String> {
        (self.func)(state)
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router").field("keys", &self.keys).finish()
    }
}

/// Destination of a conditional edge entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Node(String),
    /// Fan-out to several branches that converge on one join node.
    Parallel(Vec<String>),
    End,
}

impl Target {
    pub fn node(name: impl Into<String>) -> Self {
        let name = name.into();
        if name == END { Target::End } else { Target::Node(name) }
    }

    pub fn parallel<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Target::Parallel(names.into_iter().map(Into::into).collect())
    }
}

/// What the driver does after a step has been merged and checkpointed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Continue(String),
    ContinueParallel(Vec<String>),
    /// Halt durably until external input arrives.
    Suspend,
    /// Halt permanently. The run ends `terminated` when the state's status
    /// says so and `completed` otherwise.
    Terminate,
}
