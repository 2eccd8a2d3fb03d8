use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;
use stepflow::checkpoint::RunLifecycle;
use stepflow::graph::{GraphBuilder, GraphSpec, Target, END};
use stepflow::state::{ExecutionState, Patch};
use stepflow::workflow::LoopPolicy;
use stepflow_test_utils::builders::{memory_engine, writer, CountingNode};
use stepflow_test_utils::{init_tracing, with_timeout};

type TestResult = Result<(), Box<dyn Error>>;

/// refine <-> check loop that advances to `done` or escalates to `escalated`.
///
/// The work node becomes satisfied on pass `satisfied_at` (never, if 0).
fn loop_graph(max_attempts: u32, satisfied_at: usize) -> (GraphSpec, Arc<AtomicUsize>) {
    let policy = LoopPolicy::new("refine", max_attempts);
    let satisfied_flag = policy.satisfied_flag().to_string();

    let (work, calls) = CountingNode::handler(move |n| {
        let patch = Patch::new().attempts("refine", n as u32);
        if satisfied_at != 0 && n >= satisfied_at {
            patch.flag(satisfied_flag.clone(), true)
        } else {
            patch
        }
    });

    let graph = GraphBuilder::new()
        .add_node("refine", work)
        .add_node("check", policy.check_node())
        .add_node("done", writer("done", true))
        .add_node("escalated", writer("escalated", true))
        .set_entry("refine")
        .add_loop(
            &policy,
            "refine",
            "check",
            Target::node("done"),
            Target::node("escalated"),
        )
        .add_edge("done", END)
        .add_edge("escalated", END)
        .build()
        .unwrap();
    (graph, calls)
}

#[tokio::test]
async fn unsatisfied_loop_runs_exactly_max_attempts_then_escalates() -> TestResult {
    init_tracing();

    for max in 1..=5u32 {
        let (graph, calls) = loop_graph(max, 0);
        let (engine, _store) = memory_engine(graph);

        let report = with_timeout(engine.start(ExecutionState::new(), "loop")).await?;

        assert_eq!(report.lifecycle, RunLifecycle::Completed, "max = {max}");
        assert_eq!(calls.load(Ordering::SeqCst), max as usize, "max = {max}");
        assert_eq!(report.state.control.attempts("refine"), max);
        assert_eq!(report.state.get("escalated"), Some(&json!(true)));
        assert_eq!(report.state.get("done"), None);
        assert_eq!(
            report.state.control.value("refine_decision"),
            Some(&json!("escalate"))
        );
        // Two steps per pass plus the escalation node.
        assert_eq!(report.last_step, u64::from(max) * 2 + 1);
    }
    Ok(())
}

#[tokio::test]
async fn satisfied_loop_advances_early() -> TestResult {
    init_tracing();
    let (graph, calls) = loop_graph(3, 2);
    let (engine, _store) = memory_engine(graph);

    let report = with_timeout(engine.start(ExecutionState::new(), "loop")).await?;

    assert_eq!(report.lifecycle, RunLifecycle::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(report.state.get("done"), Some(&json!(true)));
    assert_eq!(report.state.get("escalated"), None);
    Ok(())
}

#[tokio::test]
async fn exhausted_loop_advances_when_quality_is_acceptable() -> TestResult {
    init_tracing();
    let policy = LoopPolicy::new("refine", 2).with_failure_predicate(|_| false);
    let (work, calls) = CountingNode::handler(|n| Patch::new().attempts("refine", n as u32));

    let graph = GraphBuilder::new()
        .add_node("refine", work)
        .add_node("check", policy.check_node())
        .add_node("done", writer("done", true))
        .add_node("escalated", writer("escalated", true))
        .set_entry("refine")
        .add_loop(
            &policy,
            "refine",
            "check",
            Target::node("done"),
            Target::node("escalated"),
        )
        .add_edge("done", END)
        .add_edge("escalated", END)
        .build()?;
    let (engine, _store) = memory_engine(graph);

    let report = with_timeout(engine.start(ExecutionState::new(), "loop")).await?;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(report.state.get("done"), Some(&json!(true)));
    assert_eq!(report.state.get("escalated"), None);
    Ok(())
}
