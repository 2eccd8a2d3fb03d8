// src/planner/mod.rs

//! Reference travel-planning workflow.
//!
//! ```text
//! parse_intent -> validate_budget -> check_destination -> verify_travel_time
//!   -> check_documents -> start_parallel -> {query_flights, query_hotels,
//!   query_attractions} -> aggregate_results -> budget loop -> itinerary loop
//!   -> generate_itinerary -> END
//! ```
//!
//! Either loop escalates to `human_intervention`, which continues to
//! `generate_itinerary` once a decision has been applied.

pub mod catalog;
pub mod nodes;
pub mod request;

use std::sync::Arc;

use crate::config::ConfigFile;
use crate::errors::Result;
use crate::graph::{async_handler, handler_fn, GraphBuilder, GraphSpec, Router, Target, END};
use crate::state::ExecutionState;
use crate::workflow::{HumanGate, LoopPolicy};

pub use request::{RequestParser, TravelInfo, TripRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannerOptions {
    /// Passes allowed in each optimisation loop.
    pub max_attempts: u32,
}

impl Default for PlannerOptions {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

impl From<&ConfigFile> for PlannerOptions {
    fn from(cfg: &ConfigFile) -> Self {
        Self {
            max_attempts: cfg.loops.max_attempts,
        }
    }
}

pub fn budget_policy(max_attempts: u32) -> LoopPolicy {
    LoopPolicy::new("budget", max_attempts).with_failure_predicate(nodes::still_over_budget)
}

pub fn itinerary_policy(max_attempts: u32) -> LoopPolicy {
    LoopPolicy::new("itinerary", max_attempts)
        .with_failure_predicate(nodes::itinerary_needs_review)
}

/// Build the travel-planning graph.
pub fn build_graph(options: PlannerOptions) -> Result<GraphSpec> {
    let parser = RequestParser::new()?;
    let budget = budget_policy(options.max_attempts);
    let itinerary = itinerary_policy(options.max_attempts);

    let mut builder = GraphBuilder::new()
        .add_node(
            "parse_intent",
            handler_fn(move |state| nodes::parse_intent(&parser, state)),
        )
        .add_node("validate_budget", handler_fn(nodes::validate_budget))
        .add_node("check_destination", handler_fn(nodes::check_destination))
        .add_node("verify_travel_time", handler_fn(nodes::verify_travel_time))
        .add_node("check_documents", handler_fn(nodes::check_documents))
        .add_node("start_parallel", handler_fn(nodes::start_parallel));

    for (name, fallback) in nodes::lookup_fallbacks() {
        let handler = match name {
            "query_flights" => async_handler(nodes::query_flights),
            "query_hotels" => async_handler(nodes::query_hotels),
            _ => async_handler(nodes::query_attractions),
        };
        builder = builder.add_node_with_fallback(name, handler, fallback);
    }

    let budget_work = budget.clone();
    let itinerary_work = itinerary.clone();

    builder
        .add_node("aggregate_results", handler_fn(nodes::aggregate_results))
        .add_node(
            "budget_optimization",
            handler_fn(move |state| nodes::optimize_budget(&budget_work, state)),
        )
        .add_node("check_budget_satisfaction", budget.check_node())
        .add_node(
            "itinerary_optimization",
            handler_fn(move |state| nodes::optimize_itinerary(&itinerary_work, state)),
        )
        .add_node("check_itinerary_satisfaction", itinerary.check_node())
        .add_node(
            "human_intervention",
            Arc::new(HumanGate::new(nodes::COST_ANALYSIS)),
        )
        .add_node("generate_itinerary", handler_fn(nodes::generate_itinerary))
        .set_entry("parse_intent")
        .add_conditional_edge(
            "parse_intent",
            Router::new(["validate", "query"], |state: &ExecutionState| {
                Ok(if state.control.flag(nodes::VALIDATION_COMPLETED) {
                    "query".to_string()
                } else {
                    "validate".to_string()
                })
            }),
            [
                ("validate", Target::node("validate_budget")),
                ("query", Target::node("start_parallel")),
            ],
        )
        .add_edge("validate_budget", "check_destination")
        .add_edge("check_destination", "verify_travel_time")
        .add_edge("verify_travel_time", "check_documents")
        .add_edge("check_documents", "start_parallel")
        .add_edge("start_parallel", "query_flights")
        .add_edge("start_parallel", "query_hotels")
        .add_edge("start_parallel", "query_attractions")
        .add_edge("query_flights", "aggregate_results")
        .add_edge("query_hotels", "aggregate_results")
        .add_edge("query_attractions", "aggregate_results")
        .add_edge("aggregate_results", "budget_optimization")
        .add_loop(
            &budget,
            "budget_optimization",
            "check_budget_satisfaction",
            Target::node("itinerary_optimization"),
            Target::node("human_intervention"),
        )
        .add_loop(
            &itinerary,
            "itinerary_optimization",
            "check_itinerary_satisfaction",
            Target::node("generate_itinerary"),
            Target::node("human_intervention"),
        )
        .add_edge("human_intervention", "generate_itinerary")
        .add_edge("generate_itinerary", END)
        .build()
}
