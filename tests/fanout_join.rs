use std::error::Error;
use std::time::Duration;

use proptest::prelude::*;
use serde_json::json;
use stepflow::checkpoint::{CheckpointStore, RunLifecycle};
use stepflow::graph::{handler_fn, GraphBuilder, GraphSpec, END};
use stepflow::state::{merge_fanout, BranchPatch, ExecutionState, Patch, Role};
use stepflow_test_utils::builders::{memory_engine, slow_writer, writer};
use stepflow_test_utils::{init_tracing, with_timeout};

type TestResult = Result<(), Box<dyn Error>>;

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// start -> [flights, hotels, sights] -> join -> END, where the branches
/// finish in reverse declaration order.
fn lookup_graph() -> GraphSpec {
    GraphBuilder::new()
        .add_node("start", writer("started", true))
        .add_node("flights", slow_writer(ms(60), "flight", 900))
        .add_node("hotels", slow_writer(ms(30), "hotel", 400))
        .add_node("sights", slow_writer(ms(1), "sights", json!(["Great Wall"])))
        .add_node(
            "join",
            handler_fn(|state| {
                let complete = ["flight", "hotel", "sights"]
                    .iter()
                    .all(|k| state.get(k).is_some());
                Ok(Patch::new().set("joined_complete", complete))
            }),
        )
        .set_entry("start")
        .add_edge("start", "flights")
        .add_edge("start", "hotels")
        .add_edge("start", "sights")
        .add_edge("flights", "join")
        .add_edge("hotels", "join")
        .add_edge("sights", "join")
        .add_edge("join", END)
        .build()
        .unwrap()
}

#[tokio::test]
async fn join_sees_every_branch_output() -> TestResult {
    init_tracing();
    let (engine, store) = memory_engine(lookup_graph());

    let report = with_timeout(engine.start(ExecutionState::new(), "lookups")).await?;

    assert_eq!(report.lifecycle, RunLifecycle::Completed);
    assert_eq!(report.state.get("flight"), Some(&json!(900)));
    assert_eq!(report.state.get("hotel"), Some(&json!(400)));
    assert_eq!(report.state.get("sights"), Some(&json!(["Great Wall"])));
    assert_eq!(report.state.get("joined_complete"), Some(&json!(true)));
    assert!(report.conflicts.is_empty());
    assert!(report.warnings.is_empty());

    let labels: Vec<String> = store
        .history(&report.run_id)?
        .into_iter()
        .map(|h| h.node_name)
        .collect();
    assert_eq!(labels, vec!["start", "flights,hotels,sights", "join"]);
    Ok(())
}

#[tokio::test]
async fn conflicting_branches_keep_the_later_declared_value() -> TestResult {
    init_tracing();
    let graph = GraphBuilder::new()
        .add_node("start", writer("started", true))
        .add_node("early", slow_writer(ms(40), "price", 100))
        .add_node("late", slow_writer(ms(1), "price", 200))
        .add_node("join", writer("joined", true))
        .set_entry("start")
        .add_edge("start", "early")
        .add_edge("start", "late")
        .add_edge("early", "join")
        .add_edge("late", "join")
        .add_edge("join", END)
        .build()?;
    let (engine, _store) = memory_engine(graph);

    let report = with_timeout(engine.start(ExecutionState::new(), "conflict")).await?;

    assert_eq!(report.lifecycle, RunLifecycle::Completed);
    assert_eq!(report.state.get("price"), Some(&json!(200)));
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].key, "price");
    assert_eq!(report.conflicts[0].winner, "late");
    assert_eq!(report.conflicts[0].overridden, vec!["early".to_string()]);
    assert!(
        report
            .state
            .messages
            .iter()
            .any(|m| m.role == Role::System && m.content.contains("'price'"))
    );
    Ok(())
}

#[test]
fn branch_messages_follow_declaration_order() {
    let patches = vec![
        BranchPatch {
            order: 2,
            node: "c".into(),
            patch: Patch::new().say("from c"),
        },
        BranchPatch {
            order: 0,
            node: "a".into(),
            patch: Patch::new().say("from a"),
        },
        BranchPatch {
            order: 1,
            node: "b".into(),
            patch: Patch::new().say("from b"),
        },
    ];
    let mut state = ExecutionState::new();
    merge_fanout(&mut state, patches);

    let contents: Vec<&str> = state.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["from a", "from b", "from c"]);
}

fn branch_patches(writes: &[(usize, i64)]) -> Vec<BranchPatch> {
    writes
        .iter()
        .enumerate()
        .map(|(i, (key, value))| BranchPatch {
            order: i,
            node: format!("b{i}"),
            patch: Patch::new()
                .set(format!("k{key}"), *value)
                .say(format!("from b{i}")),
        })
        .collect()
}

proptest! {
    #[test]
    fn merge_ignores_completion_order(
        writes in prop::collection::vec((0usize..3, any::<i64>()), 4),
        perm in Just(vec![0usize, 1, 2, 3]).prop_shuffle(),
    ) {
        let patches = branch_patches(&writes);

        let mut in_order = ExecutionState::new();
        let conflicts_a = merge_fanout(&mut in_order, patches.clone());

        let shuffled: Vec<BranchPatch> = perm.iter().map(|&i| patches[i].clone()).collect();
        let mut arrival_order = ExecutionState::new();
        let conflicts_b = merge_fanout(&mut arrival_order, shuffled);

        prop_assert_eq!(&in_order, &arrival_order);
        prop_assert_eq!(conflicts_a, conflicts_b);

        // The highest-ordered writer of each key wins.
        for key in 0..3usize {
            let last = writes.iter().rposition(|(k, _)| *k == key);
            let expected = last.map(|i| json!(writes[i].1));
            prop_assert_eq!(in_order.get(&format!("k{key}")).cloned(), expected);
        }
    }
}
