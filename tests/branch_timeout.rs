use std::error::Error;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use stepflow::checkpoint::{MemoryStore, RunLifecycle};
use stepflow::engine::{Engine, EngineOptions};
use stepflow::graph::{handler_fn, GraphBuilder, GraphSpec, NodeHandler, END};
use stepflow::state::{ExecutionState, Patch, Role};
use stepflow_test_utils::builders::{failing, slow_writer, writer};
use stepflow_test_utils::{init_tracing, with_timeout};

type TestResult = Result<(), Box<dyn Error>>;

fn graph_with_branch(branch: Arc<dyn NodeHandler>) -> GraphSpec {
    GraphBuilder::new()
        .add_node("start", writer("started", true))
        .add_node("flights", writer("flight", 900))
        .add_node_with_fallback("hotels", branch, Patch::new().set("hotel", 0))
        .add_node(
            "join",
            handler_fn(|state| {
                let total = ["flight", "hotel"]
                    .iter()
                    .filter_map(|k| state.get(k).and_then(|v| v.as_i64()))
                    .sum::<i64>();
                Ok(Patch::new().set("total", total))
            }),
        )
        .set_entry("start")
        .add_edge("start", "flights")
        .add_edge("start", "hotels")
        .add_edge("flights", "join")
        .add_edge("hotels", "join")
        .add_edge("join", END)
        .build()
        .unwrap()
}

fn short_timeouts() -> EngineOptions {
    EngineOptions {
        max_steps: 20,
        branch_timeout: Duration::from_millis(100),
        fanout_timeout: Duration::from_secs(1),
    }
}

#[tokio::test]
async fn timed_out_branch_is_replaced_by_its_fallback() -> TestResult {
    init_tracing();
    let graph = graph_with_branch(slow_writer(Duration::from_secs(3), "hotel", 700));
    let engine = Engine::new(Arc::new(graph), Arc::new(MemoryStore::new()), short_timeouts());

    let started = Instant::now();
    let report = with_timeout(engine.start(ExecutionState::new(), "timeout")).await?;

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(report.lifecycle, RunLifecycle::Completed);
    assert_eq!(report.state.get("hotel"), Some(&json!(0)));
    assert_eq!(report.state.get("flight"), Some(&json!(900)));
    assert_eq!(report.state.get("total"), Some(&json!(900)));

    let recorded = report
        .state
        .get("hotels_error")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    assert!(recorded.contains("Timeout"), "got {recorded:?}");
    assert_eq!(report.warnings.len(), 1);
    assert!(
        report
            .state
            .messages
            .iter()
            .any(|m| m.role == Role::System && m.content.contains("fallback"))
    );
    Ok(())
}

#[tokio::test]
async fn failing_branch_degrades_without_failing_the_run() -> TestResult {
    init_tracing();
    let graph = graph_with_branch(failing("hotel service unavailable"));
    let engine = Engine::new(Arc::new(graph), Arc::new(MemoryStore::new()), short_timeouts());

    let report = with_timeout(engine.start(ExecutionState::new(), "failure")).await?;

    assert_eq!(report.lifecycle, RunLifecycle::Completed);
    assert!(report.error.is_none());
    assert_eq!(report.state.get("hotel"), Some(&json!(0)));
    let recorded = report
        .state
        .get("hotels_error")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    assert!(recorded.contains("hotel service unavailable"), "got {recorded:?}");
    Ok(())
}

#[tokio::test]
async fn failing_single_node_terminates_the_run() -> TestResult {
    init_tracing();
    let graph = GraphBuilder::new()
        .add_node("start", failing("cannot parse request"))
        .add_node("next", writer("reached", true))
        .set_entry("start")
        .add_edge("start", "next")
        .add_edge("next", END)
        .build()?;
    let engine = Engine::new(Arc::new(graph), Arc::new(MemoryStore::new()), short_timeouts());

    let report = with_timeout(engine.start(ExecutionState::new(), "fatal")).await?;

    assert_eq!(report.lifecycle, RunLifecycle::Terminated);
    assert_eq!(report.last_step, 1);
    assert_eq!(report.state.get("reached"), None);
    let err = report.error.unwrap_or_default();
    assert!(err.contains("cannot parse request"), "got {err:?}");
    assert!(report.state.get("error").is_some());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_branch_is_bounded_by_the_branch_timeout() -> TestResult {
    init_tracing();
    let blocking = handler_fn(|_| {
        std::thread::sleep(Duration::from_millis(400));
        Ok(Patch::new().set("hotel", 700))
    });
    let graph = graph_with_branch(blocking);
    let mut options = short_timeouts();
    options.branch_timeout = Duration::from_millis(50);
    let engine = Engine::new(Arc::new(graph), Arc::new(MemoryStore::new()), options);

    let started = Instant::now();
    let report = with_timeout(engine.start(ExecutionState::new(), "blocking")).await?;

    assert!(started.elapsed() < Duration::from_millis(400), "took {:?}", started.elapsed());
    assert_eq!(report.lifecycle, RunLifecycle::Completed);
    assert_eq!(report.state.get("hotel"), Some(&json!(0)));
    assert_eq!(report.state.get("total"), Some(&json!(900)));
    let recorded = report
        .state
        .get("hotels_error")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    assert!(recorded.contains("Timeout"), "got {recorded:?}");
    assert_eq!(report.warnings.len(), 1);
    Ok(())
}
