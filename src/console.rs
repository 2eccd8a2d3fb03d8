// src/console.rs

//! Terminal side of the CLI: prompts for suspended runs and report output.

use dialoguer::{Input, Select};
use tracing::warn;

use crate::checkpoint::{HistoryEntry, RunSummary};
use crate::engine::{InputFuture, InputSource, ResumeInput, RunReport, StepUpdate};
use crate::state::{ExecutionState, Phase, Role};
use crate::workflow::Decision;

/// Prompts on the terminal whenever a run suspends.
///
/// A pending confirmation is answered with a selection menu; anything else
/// with a free-text line. Escape or an empty line leaves the run suspended.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleInput;

impl InputSource for ConsoleInput {
    fn request_input<'a>(&'a self, run_id: &'a str, state: &'a ExecutionState) -> InputFuture<'a> {
        let status = state.status;
        let prompt = state
            .last_message(Role::Assistant)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let run_id = run_id.to_string();

        Box::pin(async move {
            let answer = tokio::task::spawn_blocking(move || ask(status, &prompt)).await;
            match answer {
                Ok(input) => input,
                Err(e) => {
                    warn!(%run_id, error = %e, "input prompt failed; leaving run suspended");
                    None
                }
            }
        })
    }
}

fn ask(status: Phase, prompt: &str) -> Option<ResumeInput> {
    if !prompt.is_empty() {
        println!("\n{prompt}");
    }

    if status == Phase::WaitingConfirmation {
        let labels: Vec<String> = Decision::ALL
            .iter()
            .map(|d| format!("{} ({})", d.as_str(), d.describe()))
            .collect();
        let choice = Select::new()
            .with_prompt("Your decision")
            .items(&labels)
            .default(0)
            .interact_opt()
            .ok()
            .flatten()?;
        return Some(ResumeInput::decision(Decision::ALL[choice].as_str()));
    }

    let text: String = Input::new()
        .with_prompt("Your answer")
        .allow_empty(true)
        .interact_text()
        .ok()?;
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(ResumeInput::message(text))
    }
}

/// Ask the user to pick one of the resumable runs.
pub fn select_run(runs: &[RunSummary]) -> anyhow::Result<Option<String>> {
    if runs.is_empty() {
        return Ok(None);
    }
    let labels: Vec<String> = runs.iter().map(describe_run).collect();
    let choice = Select::new()
        .with_prompt("Resume which run?")
        .items(&labels)
        .default(0)
        .interact_opt()?;
    Ok(choice.map(|i| runs[i].run_id.clone()))
}

pub fn describe_run(run: &RunSummary) -> String {
    format!(
        "{}  [{}] step {} at {}  {}",
        run.run_id,
        run.lifecycle,
        run.latest_step,
        run.latest_node.as_deref().unwrap_or("-"),
        run.summary
    )
}

pub fn print_runs(runs: &[RunSummary]) {
    if runs.is_empty() {
        println!("no resumable runs");
        return;
    }
    for run in runs {
        println!("{}", describe_run(run));
    }
}

pub fn print_history(run_id: &str, entries: &[HistoryEntry]) {
    println!("history of {run_id} ({} checkpoints):", entries.len());
    for entry in entries {
        println!(
            "  {:>4}  {}  {}",
            entry.step,
            entry.timestamp.to_rfc3339(),
            entry.node_name
        );
    }
}

pub fn print_update(update: &StepUpdate) {
    println!(
        "[{} #{}] {} -> {}",
        update.run_id,
        update.step,
        update.nodes.join(", "),
        update.status
    );
}

pub fn print_report(report: &RunReport) {
    println!();
    if let Some(message) = report.last_message() {
        println!("{message}");
        println!();
    }
    for warning in &report.warnings {
        println!("warning: {warning}");
    }
    if let Some(err) = &report.error {
        println!("error: {err}");
    }
    println!(
        "run {} is {} after step {} (status: {})",
        report.run_id, report.lifecycle, report.last_step, report.state.status
    );
    if report.is_suspended() {
        println!(
            "resume with: stepflow resume --run-id {} [--decision ...] [--message ...]",
            report.run_id
        );
    }
}
