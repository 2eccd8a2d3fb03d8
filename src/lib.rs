// src/lib.rs

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod console;
pub mod engine;
pub mod errors;
pub mod graph;
pub mod logging;
pub mod planner;
pub mod state;
pub mod types;
pub mod workflow;

use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::checkpoint::{open_store, CheckpointStore, MemoryStore};
use crate::cli::{CliArgs, Command};
use crate::config::{load_and_validate, ConfigFile};
use crate::engine::{Engine, EngineOptions, ResumeInput, RunReport, StepUpdate};
use crate::graph::{Edges, GraphSpec, Target};
use crate::planner::PlannerOptions;
use crate::state::ExecutionState;
use crate::workflow::Decision;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - the planner graph
/// - the checkpoint store
/// - the engine and, when interactive, the terminal input source
pub async fn run(args: CliArgs) -> Result<()> {
    let cfg = load_and_validate(&args.config)?;
    debug!(?cfg, "configuration loaded");

    match args.command {
        Command::Run {
            request,
            interactive,
            no_persistence,
        } => {
            let store: Arc<dyn CheckpointStore> = if no_persistence {
                Arc::new(MemoryStore::new())
            } else {
                open_store(cfg.store.mode, &cfg.store.path)?
            };
            let initial = ExecutionState::from_request(request.clone(), interactive);
            let report = drive(&cfg, store, interactive, move |engine| async move {
                engine.start(initial, &request).await
            })
            .await?;
            console::print_report(&report);
        }

        Command::Resume {
            run_id,
            decision,
            message,
            interactive,
        } => {
            let store = open_store(cfg.store.mode, &cfg.store.path)?;
            let run_id = match run_id {
                Some(id) => id,
                None => match console::select_run(&store.list_active()?)? {
                    Some(id) => id,
                    None => bail!("no run selected"),
                },
            };
            let input = ResumeInput {
                message,
                decision: decision.map(|d| Decision::from(d).to_string()),
                ..ResumeInput::default()
            };
            let report = drive(&cfg, store, interactive, move |engine| async move {
                engine.resume(&run_id, input).await
            })
            .await?;
            console::print_report(&report);
        }

        Command::Runs => {
            let store = open_store(cfg.store.mode, &cfg.store.path)?;
            console::print_runs(&store.list_active()?);
        }

        Command::History { run_id } => {
            let store = open_store(cfg.store.mode, &cfg.store.path)?;
            let entries = store.history(&run_id)?;
            if entries.is_empty() {
                bail!("no checkpoints for run '{run_id}'");
            }
            console::print_history(&run_id, &entries);
        }

        Command::Graph => {
            let graph = planner::build_graph(PlannerOptions::from(&cfg))?;
            print_graph(&graph);
        }
    }

    Ok(())
}

/// Build the engine, stream step updates to stdout while `f` drives it,
/// and return the final report.
async fn drive<F, Fut>(
    cfg: &ConfigFile,
    store: Arc<dyn CheckpointStore>,
    interactive: bool,
    f: F,
) -> Result<RunReport>
where
    F: FnOnce(Arc<Engine>) -> Fut,
    Fut: std::future::Future<Output = errors::Result<RunReport>>,
{
    let graph = Arc::new(planner::build_graph(PlannerOptions::from(cfg))?);
    let (tx, mut rx) = mpsc::channel::<StepUpdate>(64);

    let mut engine = Engine::new(graph, store, EngineOptions::from(cfg)).with_events(tx);
    if interactive {
        engine = engine.with_input_source(Arc::new(console::ConsoleInput));
    }
    let engine = Arc::new(engine);

    let printer = tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            console::print_update(&update);
        }
    });

    let result = f(Arc::clone(&engine)).await;
    // Closing the channel ends the printer.
    drop(engine);
    if let Err(e) = printer.await {
        debug!(error = %e, "progress printer ended abnormally");
    }

    let report = result?;
    info!(run_id = %report.run_id, lifecycle = %report.lifecycle, "drive finished");
    Ok(report)
}

/// Print nodes and edges of a validated graph.
fn print_graph(graph: &GraphSpec) {
    println!("stepflow graph (entry: {})", graph.entry());
    for name in graph.node_names() {
        let fallback = graph
            .node(name)
            .is_some_and(|n| n.fallback.is_some());
        println!("  - {name}{}", if fallback { " (fallback)" } else { "" });
        match graph.edges(name) {
            Edges::None => println!("      -> (end)"),
            Edges::Static(targets) => println!("      -> {}", targets.join(", ")),
            Edges::Conditional { targets, .. } => {
                for (key, target) in targets {
                    let to = match target {
                        Target::Node(n) => n.clone(),
                        Target::Parallel(ns) => format!("[{}]", ns.join(", ")),
                        Target::End => "(end)".to_string(),
                    };
                    println!("      {key} -> {to}");
                }
            }
        }
    }
}
