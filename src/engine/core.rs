// src/engine/core.rs

//! Pure routing core.
//!
//! Everything here is synchronous and deterministic: given a graph, the
//! merged state and the nodes that just ran, decide what happens next. The
//! async driver in [`super::runtime`] owns handlers, timeouts, persistence
//! and channels; this module is unit tested without any of them.

use tracing::{debug, warn};

use crate::checkpoint::RunLifecycle;
use crate::errors::{Result, StepflowError};
use crate::graph::{Edges, GraphSpec, Route, Target};
use crate::state::{ExecutionState, Patch, Phase, PhaseClass};

use super::ResumeInput;

/// Status checks that run before any edge is consulted.
///
/// An awaiting-input status suspends and a terminal status halts, whatever
/// the outgoing edges say.
pub fn phase_gate(status: Phase) -> Option<Route> {
    match status.class() {
        PhaseClass::Runnable => None,
        PhaseClass::AwaitingInput => Some(Route::Suspend),
        PhaseClass::Terminal => Some(Route::Terminate),
    }
}

/// Resolve the route after `current` ran and its output was merged.
///
/// Router failures surface as `Handler` errors and unknown router keys as
/// `Routing` errors; both are fatal to the run.
pub fn resolve_next(spec: &GraphSpec, state: &ExecutionState, current: &[String]) -> Result<Route> {
    if let Some(route) = phase_gate(state.status) {
        debug!(status = %state.status, ?route, "phase gate decided route");
        return Ok(route);
    }

    match current {
        [] => Ok(Route::Terminate),
        [node] => resolve_single(spec, state, node),
        branches => match spec.join_of(branches) {
            Some(join) => Ok(Route::Continue(join.to_string())),
            None => Err(StepflowError::Configuration(format!(
                "fan-out group {branches:?} has no join node"
            ))),
        },
    }
}

fn resolve_single(spec: &GraphSpec, state: &ExecutionState, node: &str) -> Result<Route> {
    match spec.edges(node) {
        Edges::None => Ok(Route::Terminate),
        Edges::Static(targets) => Ok(route_static(targets)),
        Edges::Conditional { router, targets } => {
            let key = router.route(state).map_err(|e| StepflowError::Handler {
                node: node.to_string(),
                message: format!("router failed: {e:#}"),
            })?;
            let target = targets.get(&key).ok_or_else(|| StepflowError::Routing {
                node: node.to_string(),
                key: key.clone(),
            })?;
            debug!(node, key = %key, ?target, "router selected target");
            Ok(match target {
                Target::Node(name) => Route::Continue(name.clone()),
                Target::Parallel(names) => Route::ContinueParallel(names.clone()),
                Target::End => Route::Terminate,
            })
        }
    }
}

fn route_static(targets: &[String]) -> Route {
    match targets {
        [] => Route::Terminate,
        [only] if only == crate::graph::END => Route::Terminate,
        [only] => Route::Continue(only.clone()),
        many => Route::ContinueParallel(many.to_vec()),
    }
}

/// Route that re-enters the nodes whose output suspended a run.
///
/// A suspended fan-out group runs again as a whole against the resumed
/// state. Only a label that no longer matches the graph falls back to the
/// entry node.
pub fn reentry_route(spec: &GraphSpec, nodes: &[String]) -> Route {
    match nodes {
        [node] if spec.contains(node) => Route::Continue(node.clone()),
        [_, _, ..] if nodes.iter().all(|n| spec.contains(n)) && spec.join_of(nodes).is_some() => {
            Route::ContinueParallel(nodes.to_vec())
        }
        _ => {
            warn!(?nodes, entry = spec.entry(), "re-entering at the entry node");
            Route::Continue(spec.entry().to_string())
        }
    }
}

/// Patch applied to a suspended state when external input arrives.
///
/// The status goes back to `processing` unless the input names a status or
/// the state is already runnable.
pub fn resume_patch(input: ResumeInput, current: Phase) -> Patch {
    let explicit = input.status;
    let mut patch = input.into_patch();
    if explicit.is_none() && !current.is_runnable() {
        patch.status = Some(Phase::Processing);
    }
    patch
}

/// Lifecycle recorded when a run halts on `route`.
pub fn halt_lifecycle(route: &Route, status: Phase, failed: bool) -> RunLifecycle {
    match route {
        Route::Suspend => RunLifecycle::Suspended,
        _ if failed || status == Phase::Terminated => RunLifecycle::Terminated,
        _ => RunLifecycle::Completed,
    }
}

/// Label stored as a checkpoint's `node_name`.
pub fn checkpoint_label(nodes: &[String]) -> String {
    nodes.join(",")
}
