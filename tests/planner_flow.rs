use std::error::Error;
use std::sync::Arc;

use serde_json::Value;
use stepflow::checkpoint::{CheckpointStore, RunLifecycle, SqliteStore};
use stepflow::engine::{Engine, ResumeInput, RunReport};
use stepflow::planner::{build_graph, PlannerOptions};
use stepflow::state::{ExecutionState, Phase};
use stepflow_test_utils::builders::{memory_engine, test_options};
use stepflow_test_utils::{init_tracing, with_timeout};

type TestResult = Result<(), Box<dyn Error>>;

fn planner_engine() -> Engine {
    let graph = build_graph(PlannerOptions::default()).unwrap();
    memory_engine(graph).0
}

fn executed_nodes(report: &RunReport) -> Vec<String> {
    report
        .steps
        .iter()
        .map(|s| s.nodes.join(","))
        .collect()
}

fn cost(report: &RunReport, field: &str) -> Option<Value> {
    report
        .state
        .get("cost_analysis")
        .and_then(|c| c.get(field))
        .cloned()
}

#[tokio::test]
async fn affordable_trip_completes_without_intervention() -> TestResult {
    init_tracing();
    let engine = planner_engine();
    let request = "5 days in Beijing, budget 8000 yuan";

    let report = with_timeout(engine.start(ExecutionState::from_request(request, false), request)).await?;

    assert_eq!(report.lifecycle, RunLifecycle::Completed);
    assert_eq!(report.state.status, Phase::Completed);
    assert_eq!(report.last_step, 15);
    assert_eq!(
        executed_nodes(&report),
        vec![
            "parse_intent",
            "validate_budget",
            "check_destination",
            "verify_travel_time",
            "check_documents",
            "start_parallel",
            "query_flights,query_hotels,query_attractions",
            "aggregate_results",
            "budget_optimization",
            "check_budget_satisfaction",
            "itinerary_optimization",
            "check_itinerary_satisfaction",
            "itinerary_optimization",
            "check_itinerary_satisfaction",
            "generate_itinerary",
        ]
    );
    assert_eq!(cost(&report, "is_over_budget"), Some(Value::Bool(false)));
    let itinerary = report
        .state
        .get("itinerary")
        .and_then(Value::as_str)
        .unwrap_or_default();
    assert!(itinerary.contains("Beijing in 5 days"));
    assert!(itinerary.contains("Forbidden City"));
    assert!(report.warnings.is_empty());
    Ok(())
}

#[tokio::test]
async fn hopeless_budget_escalates_and_is_auto_accepted() -> TestResult {
    init_tracing();
    let engine = planner_engine();
    let request = "5 days in Europe, budget 4000 yuan";

    let report = with_timeout(engine.start(ExecutionState::from_request(request, false), request)).await?;

    assert_eq!(report.lifecycle, RunLifecycle::Completed);
    let nodes = executed_nodes(&report);
    assert!(nodes.contains(&"human_intervention".to_string()));
    assert!(!nodes.contains(&"itinerary_optimization".to_string()));
    assert!(cost(&report, "human_adjustment").is_some());
    assert!(report.state.get("itinerary").is_some());
    Ok(())
}

#[tokio::test]
async fn interactive_escalation_can_be_terminated() -> TestResult {
    init_tracing();
    let engine = planner_engine();
    let request = "5 days in Europe, budget 4000 yuan";

    let suspended = with_timeout(engine.start(ExecutionState::from_request(request, true), request)).await?;
    assert!(suspended.is_suspended());
    assert_eq!(suspended.state.status, Phase::WaitingConfirmation);
    assert_eq!(
        executed_nodes(&suspended).last().map(String::as_str),
        Some("human_intervention")
    );

    let report = with_timeout(engine.resume(&suspended.run_id, ResumeInput::decision("terminate"))).await?;

    assert_eq!(report.lifecycle, RunLifecycle::Terminated);
    assert_eq!(report.state.status, Phase::Terminated);
    assert!(report.state.get("itinerary").is_none());
    Ok(())
}

#[tokio::test]
async fn missing_details_are_collected_across_resumes() -> TestResult {
    init_tracing();
    let engine = planner_engine();

    let first = with_timeout(engine.start(ExecutionState::from_request("A trip to Shanghai please", false), "shanghai")).await?;
    assert!(first.is_suspended());
    assert_eq!(first.state.status, Phase::CollectingInfo);
    assert_eq!(
        first.state.control.value("missing"),
        Some(&serde_json::json!(["days", "budget"]))
    );

    let second = with_timeout(engine.resume(&first.run_id, ResumeInput::message("4"))).await?;
    assert!(second.is_suspended());
    assert_eq!(
        second.state.control.value("missing"),
        Some(&serde_json::json!(["budget"]))
    );

    let done = with_timeout(engine.resume(&first.run_id, ResumeInput::message("skip"))).await?;
    assert_eq!(done.lifecycle, RunLifecycle::Completed);
    let info = done.state.get("travel_info").cloned().unwrap_or(Value::Null);
    assert_eq!(info["destination"], "Shanghai");
    assert_eq!(info["days"], 4);
    assert_eq!(info["budget"], 5000.0);
    Ok(())
}

#[tokio::test]
async fn sqlite_run_resumes_in_a_fresh_engine() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let db = dir.path().join("state").join("checkpoints.db");

    let run_id = {
        let store = Arc::new(SqliteStore::open(&db)?);
        let engine = Engine::new(
            Arc::new(build_graph(PlannerOptions::default())?),
            store,
            test_options(),
        );
        let report = with_timeout(engine.start(ExecutionState::from_request("I want to go to Xian", true), "xian")).await?;
        assert!(report.is_suspended());
        report.run_id
    };

    let store = Arc::new(SqliteStore::open(&db)?);
    let active = store.list_active()?;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].run_id, run_id);
    assert_eq!(active[0].lifecycle, RunLifecycle::Suspended);

    let engine = Engine::new(
        Arc::new(build_graph(PlannerOptions::default())?),
        store.clone(),
        test_options(),
    );
    let report = with_timeout(engine.resume(&run_id, ResumeInput::message("4 days, budget 5000 yuan"))).await?;

    assert_eq!(report.lifecycle, RunLifecycle::Completed);
    assert_eq!(cost(&report, "is_over_budget"), Some(Value::Bool(false)));
    assert!(store.list_active()?.is_empty());

    let steps: Vec<u64> = store.history(&run_id)?.iter().map(|h| h.step).collect();
    assert!(steps.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(steps.first(), Some(&1));
    assert_eq!(steps.last(), Some(&report.last_step));
    Ok(())
}
