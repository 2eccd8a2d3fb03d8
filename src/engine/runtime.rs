// src/engine/runtime.rs

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{new_run_id, Checkpoint, CheckpointStore, RunLifecycle, RunSummary};
use crate::errors::{Result, StepflowError};
use crate::graph::{GraphSpec, NodeContext, Route};
use crate::state::{merge_fanout, ExecutionState, MergeConflict, Message, Patch, Phase, Role};

use super::core;
use super::fanout::FanOutCoordinator;
use super::{EngineOptions, ResumeInput, StepRecord, StepUpdate};

/// Future returned by [`InputSource::request_input`].
pub type InputFuture<'a> = Pin<Box<dyn Future<Output = Option<ResumeInput>> + Send + 'a>>;

/// Supplies external input in-process when a run suspends.
///
/// Returning `None` leaves the run suspended; it can still be resumed later
/// through [`Engine::resume`].
pub trait InputSource: Send + Sync {
    fn request_input<'a>(&'a self, run_id: &'a str, state: &'a ExecutionState) -> InputFuture<'a>;
}

/// Result of driving a run until it suspends or halts.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub lifecycle: RunLifecycle,
    pub state: ExecutionState,
    /// Last persisted step number.
    pub last_step: u64,
    /// States produced by this drive, one per step.
    pub steps: Vec<StepRecord>,
    /// Non-fatal problems (persistence failures, branch fallbacks).
    pub warnings: Vec<String>,
    pub conflicts: Vec<MergeConflict>,
    /// The error that terminated the run, if any.
    pub error: Option<String>,
}

impl RunReport {
    fn new(run_id: &str, state: ExecutionState, last_step: u64) -> Self {
        Self {
            run_id: run_id.to_string(),
            lifecycle: RunLifecycle::Active,
            state,
            last_step,
            steps: Vec::new(),
            warnings: Vec::new(),
            conflicts: Vec::new(),
            error: None,
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.lifecycle == RunLifecycle::Suspended
    }

    /// Latest assistant-facing message, what a caller shows the user.
    pub fn last_message(&self) -> Option<&str> {
        self.state
            .last_message(Role::Assistant)
            .map(|m| m.content.as_str())
    }
}

/// Drives runs of one graph.
///
/// The engine owns no run state between calls: everything needed to
/// continue a run lives in the injected [`CheckpointStore`].
pub struct Engine {
    graph: Arc<GraphSpec>,
    store: Arc<dyn CheckpointStore>,
    options: EngineOptions,
    fanout: FanOutCoordinator,
    events: Option<mpsc::Sender<StepUpdate>>,
    input: Option<Arc<dyn InputSource>>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("entry", &self.graph.entry())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(graph: Arc<GraphSpec>, store: Arc<dyn CheckpointStore>, options: EngineOptions) -> Self {
        Self {
            graph,
            store,
            options,
            fanout: FanOutCoordinator::new(options.branch_timeout, options.fanout_timeout),
            events: None,
            input: None,
        }
    }

    /// Send a [`StepUpdate`] to `tx` after every step.
    pub fn with_events(mut self, tx: mpsc::Sender<StepUpdate>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn with_input_source(mut self, source: Arc<dyn InputSource>) -> Self {
        self.input = Some(source);
        self
    }

    pub fn graph(&self) -> &GraphSpec {
        &self.graph
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Runs that can be resumed, newest first.
    pub fn list_resumable(&self) -> Result<Vec<RunSummary>> {
        self.store.list_active()
    }

    /// Start a new run at the entry node.
    pub async fn start(&self, initial: ExecutionState, summary: &str) -> Result<RunReport> {
        self.start_with_id(&new_run_id(), initial, summary).await
    }

    pub async fn start_with_id(
        &self,
        run_id: &str,
        initial: ExecutionState,
        summary: &str,
    ) -> Result<RunReport> {
        if self.store.load_latest(run_id)?.is_some() {
            return Err(StepflowError::Configuration(format!(
                "run '{run_id}' already exists; use resume"
            )));
        }

        info!(run_id, entry = self.graph.entry(), "starting run");
        let mut report = RunReport::new(run_id, initial, 0);
        if let Err(e) = self.store.register_run(run_id, summary) {
            self.persistence_warning(&mut report, format!("could not register run: {e}"));
        }

        let entry = Route::Continue(self.graph.entry().to_string());
        Ok(self.drive(report, entry).await)
    }

    /// Continue a run from its latest checkpoint.
    ///
    /// `input` is applied as a patch before any node runs. A run that was
    /// suspended re-enters at the node that suspended it; a run whose driver
    /// died mid-flight continues with the route after its last checkpoint.
    pub async fn resume(&self, run_id: &str, input: ResumeInput) -> Result<RunReport> {
        if let Some(lifecycle) = self.store.lifecycle(run_id)? {
            if !lifecycle.is_resumable() {
                return Err(StepflowError::RunFinished(run_id.to_string()));
            }
        }

        let checkpoint = self
            .store
            .load_latest(run_id)?
            .ok_or_else(|| StepflowError::RunNotFound(run_id.to_string()))?;

        if checkpoint.state.status.is_terminal() {
            return Err(StepflowError::RunFinished(run_id.to_string()));
        }

        let nodes: Vec<String> = checkpoint.nodes().into_iter().map(str::to_string).collect();
        let awaiting = checkpoint.state.status.awaits_input();
        info!(
            run_id,
            step = checkpoint.step,
            node = %checkpoint.node_name,
            status = %checkpoint.state.status,
            "resuming run"
        );

        let mut state = checkpoint.state;
        state.apply(core::resume_patch(input, state.status));

        let mut report = RunReport::new(run_id, state, checkpoint.step);
        self.mark(&mut report, RunLifecycle::Active);

        let next = if awaiting {
            core::reentry_route(&self.graph, &nodes)
        } else {
            match core::resolve_next(&self.graph, &report.state, &nodes) {
                Ok(route) => route,
                Err(e) => {
                    let step = report.last_step + 1;
                    self.fail(&mut report, &nodes, step, e.to_string()).await;
                    Route::Terminate
                }
            }
        };

        Ok(self.drive(report, next).await)
    }

    /// Main driver loop.
    ///
    /// Per step: execute the scheduled node(s), merge, resolve the next
    /// route, persist, notify, then act on the route.
    async fn drive(&self, mut report: RunReport, mut next: Route) -> RunReport {
        let run_id = report.run_id.clone();
        let cancel = CancellationToken::new();
        let mut last_nodes: Vec<String> = Vec::new();
        let mut executed: u64 = 0;

        loop {
            let current = match next {
                Route::Continue(node) => vec![node],
                Route::ContinueParallel(nodes) => nodes,
                Route::Suspend => {
                    self.mark(&mut report, RunLifecycle::Suspended);
                    match self.request_input(&run_id, &report.state).await {
                        Some(input) => {
                            info!(run_id = %run_id, "continuing with in-process input");
                            self.mark(&mut report, RunLifecycle::Active);
                            let patch = core::resume_patch(input, report.state.status);
                            report.state.apply(patch);
                            next = core::reentry_route(&self.graph, &last_nodes);
                            continue;
                        }
                        None => {
                            info!(run_id = %run_id, step = report.last_step, "run suspended");
                            return report;
                        }
                    }
                }
                Route::Terminate => {
                    let lifecycle = core::halt_lifecycle(
                        &Route::Terminate,
                        report.state.status,
                        report.error.is_some(),
                    );
                    self.mark(&mut report, lifecycle);
                    info!(run_id = %run_id, %lifecycle, step = report.last_step, "run finished");
                    return report;
                }
            };

            let step = report.last_step + 1;

            if executed >= self.options.max_steps {
                let err = format!(
                    "step limit of {} reached before running {:?}",
                    self.options.max_steps, current
                );
                self.fail(&mut report, &current, step, err).await;
                next = Route::Terminate;
                continue;
            }
            executed += 1;

            debug!(run_id = %run_id, step, nodes = ?current, "executing step");

            let outcome = if current.len() == 1 {
                self.run_single(&report.state, &current[0], &run_id, step)
                    .await
            } else {
                self.run_group(&mut report, &current, step, &cancel).await;
                Ok(None)
            };

            let route = match outcome {
                Ok(Some(patch)) => {
                    report.state.apply(patch);
                    core::resolve_next(&self.graph, &report.state, &current)
                }
                Ok(None) => core::resolve_next(&self.graph, &report.state, &current),
                Err(e) => Err(e),
            };

            next = match route {
                Ok(route) => {
                    self.persist(&mut report, &current, step).await;
                    route
                }
                Err(e) => {
                    self.fail(&mut report, &current, step, e.to_string()).await;
                    Route::Terminate
                }
            };
            last_nodes = current;
        }
    }

    /// Execute a lone node. Errors are fatal to the run.
    async fn run_single(
        &self,
        state: &ExecutionState,
        node: &str,
        run_id: &str,
        step: u64,
    ) -> Result<Option<Patch>> {
        let entry = self.graph.node(node).ok_or_else(|| {
            StepflowError::Configuration(format!("node '{node}' is not declared"))
        })?;
        let ctx = NodeContext::new(run_id, node, step);
        let patch = entry
            .handler
            .run(state, &ctx)
            .await
            .map_err(|e| StepflowError::Handler {
                node: node.to_string(),
                message: format!("{e:#}"),
            })?;
        Ok(Some(patch))
    }

    /// Execute a fan-out group and merge it into the report's state.
    async fn run_group(
        &self,
        report: &mut RunReport,
        branches: &[String],
        step: u64,
        cancel: &CancellationToken,
    ) {
        let outcome = self
            .fanout
            .run(&self.graph, &report.state, branches, &report.run_id, step, cancel)
            .await;

        for failure in &outcome.failures {
            report.warnings.push(failure.to_string());
        }

        let conflicts = merge_fanout(&mut report.state, outcome.patches);
        for conflict in &conflicts {
            report.state.messages.push(Message::system(format!(
                "branches {:?} and '{}' both wrote '{}'; kept the value from '{}'",
                conflict.overridden, conflict.winner, conflict.key, conflict.winner
            )));
        }
        report.conflicts.extend(conflicts);
    }

    /// Record a fatal error, mark the state terminated and checkpoint it.
    async fn fail(&self, report: &mut RunReport, nodes: &[String], step: u64, err: String) {
        error!(run_id = %report.run_id, step, ?nodes, error = %err, "run failed");
        report.state.apply(
            Patch::new()
                .status(Phase::Terminated)
                .set("error", err.clone())
                .message(Message::system(format!("run terminated: {err}"))),
        );
        report.error = Some(err);
        self.persist(report, nodes, step).await;
    }

    /// Best-effort checkpoint of the current state, then progress events.
    async fn persist(&self, report: &mut RunReport, nodes: &[String], step: u64) {
        let label = core::checkpoint_label(nodes);
        let checkpoint = Checkpoint::new(report.run_id.clone(), step, label, report.state.clone());

        match self.store.save(&checkpoint) {
            Ok(()) => debug!(run_id = %report.run_id, step, node = %checkpoint.node_name, "checkpoint saved"),
            Err(e) => self.persistence_warning(
                report,
                format!("checkpoint for step {step} was not saved: {e}"),
            ),
        }

        report.last_step = step;
        report.steps.push(StepRecord {
            step,
            nodes: nodes.to_vec(),
            state: report.state.clone(),
        });

        if let Some(tx) = &self.events {
            let update = StepUpdate {
                run_id: report.run_id.clone(),
                step,
                nodes: nodes.to_vec(),
                status: report.state.status,
                message: report.last_message().map(str::to_string),
            };
            if tx.send(update).await.is_err() {
                debug!(run_id = %report.run_id, step, "progress receiver dropped");
            }
        }
    }

    fn mark(&self, report: &mut RunReport, lifecycle: RunLifecycle) {
        report.lifecycle = lifecycle;
        if let Err(e) = self.store.set_lifecycle(&report.run_id, lifecycle) {
            self.persistence_warning(report, format!("could not record lifecycle {lifecycle}: {e}"));
        }
    }

    fn persistence_warning(&self, report: &mut RunReport, msg: String) {
        warn!(run_id = %report.run_id, "{msg}");
        report.state.messages.push(Message::system(msg.clone()));
        report.warnings.push(msg);
    }

    async fn request_input(&self, run_id: &str, state: &ExecutionState) -> Option<ResumeInput> {
        let source = self.input.as_ref()?;
        source.request_input(run_id, state).await
    }
}
