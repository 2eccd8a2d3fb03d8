// src/planner/nodes.rs

//! Node handlers of the travel-planning graph.
//!
//! Every handler is deterministic: prices come from [`catalog`], so a run
//! replayed from a checkpoint produces the same outputs.

use std::collections::BTreeMap;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::graph::NodeContext;
use crate::planner::catalog::{self, AttractionList, FlightQuote, HotelQuote};
use crate::planner::request::{RequestParser, TravelInfo, TripRequest};
use crate::state::{ExecutionState, Patch, Phase, Role};
use crate::workflow::gate::OVER_BUDGET_ACCEPTED;
use crate::workflow::LoopPolicy;

pub const TRIP_REQUEST: &str = "trip_request";
pub const TRAVEL_INFO: &str = "travel_info";
pub const FLIGHT_INFO: &str = "flight_info";
pub const HOTEL_INFO: &str = "hotel_info";
pub const ATTRACTIONS_INFO: &str = "attractions_info";
pub const QUERY_RESULTS: &str = "query_results";
pub const COST_ANALYSIS: &str = "cost_analysis";
pub const ITINERARY: &str = "itinerary";

pub const VALIDATION_COMPLETED: &str = "validation_completed";

const OTHER_COSTS: f64 = 500.0;
const SKIP_WORDS: &[&str] = &["skip", "defaults"];

fn travel_info(state: &ExecutionState) -> anyhow::Result<TravelInfo> {
    state
        .get_as(TRAVEL_INFO)
        .context("travel_info is missing; the request was never parsed")
}

// ---------------------------------------------------------------------------
// intake and sequential validation
// ---------------------------------------------------------------------------

pub fn parse_intent(parser: &RequestParser, state: &ExecutionState) -> anyhow::Result<Patch> {
    let latest = state
        .last_message(Role::User)
        .map(|m| m.content.trim().to_string())
        .unwrap_or_default();

    let request = match state.get_as::<TripRequest>(TRIP_REQUEST) {
        None => parser.parse(&latest),
        Some(partial) if SKIP_WORDS.contains(&latest.to_lowercase().as_str()) => {
            info!("filling missing trip fields with defaults");
            partial.with_defaults()
        }
        Some(mut partial) => {
            if let Some(field) = partial.missing().first().copied() {
                parser.answer(&mut partial, field, &latest);
            }
            partial
        }
    };

    let patch = Patch::new().set(TRIP_REQUEST, serde_json::to_value(&request)?);

    let Some(info) = request.complete() else {
        let missing = request.missing();
        debug!(?missing, "trip request incomplete");
        let prompts: Vec<&str> = missing.iter().map(|f| f.prompt()).collect();
        let keys: Vec<&str> = missing.iter().map(|f| f.key()).collect();
        return Ok(patch
            .control_value("missing", json!(keys))
            .status(Phase::CollectingInfo)
            .say(format!(
                "I need a little more information:\n{}\n(reply \"skip\" to use defaults)",
                prompts.join("\n")
            )));
    };

    let summary = format!(
        "Got it: {}, {} days, budget {:.0}.",
        info.destination, info.days, info.budget
    );
    Ok(patch
        .set(TRAVEL_INFO, serde_json::to_value(&info)?)
        .control_value("missing", json!([]))
        .status(Phase::Planning)
        .say(summary))
}

pub fn validate_budget(state: &ExecutionState) -> anyhow::Result<Patch> {
    let info = travel_info(state)?;
    let per_day = f64::from(catalog::daily_expense(&info.destination) + 200);
    let recommended = per_day * f64::from(info.days);
    let status = if info.budget >= recommended {
        "sufficient"
    } else {
        "insufficient"
    };
    info!(budget = info.budget, recommended, status, "budget validated");
    Ok(Patch::new()
        .control_value("budget_status", status)
        .control_value("recommended_budget", recommended))
}

pub fn check_destination(state: &ExecutionState) -> anyhow::Result<Patch> {
    let info = travel_info(state)?;
    let is = |list: &[&str]| list.iter().any(|d| d.eq_ignore_ascii_case(&info.destination));
    let status = if is(catalog::RESTRICTED) {
        "restricted"
    } else if is(catalog::POPULAR) {
        "popular"
    } else {
        "normal"
    };
    let patch = Patch::new().control_value("destination_status", status);
    Ok(if status == "restricted" {
        patch.say(format!(
            "Note: travel to {} is currently restricted.",
            info.destination
        ))
    } else {
        patch
    })
}

pub fn verify_travel_time(state: &ExecutionState) -> anyhow::Result<Patch> {
    let info = travel_info(state)?;
    let peak = info
        .travel_date
        .as_deref()
        .is_some_and(|d| d.contains("spring festival") || d.contains("national day"));
    Ok(Patch::new().control_value(
        "time_status",
        if peak { "peak_season" } else { "normal_season" },
    ))
}

pub fn check_documents(state: &ExecutionState) -> anyhow::Result<Patch> {
    let info = travel_info(state)?;
    let contains = |list: &[&str]| {
        list.iter()
            .any(|d| info.destination.to_lowercase().contains(&d.to_lowercase()))
    };
    let documents = if contains(catalog::INTERNATIONAL) {
        "international"
    } else if contains(catalog::DOMESTIC) {
        "domestic"
    } else {
        "unknown"
    };

    let control = &state.control;
    let describe = |key: &str| {
        control
            .value(key)
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string()
    };
    let summary = format!(
        "Pre-checks done. Budget: {}, destination: {}, season: {}, documents: {documents}.",
        describe("budget_status"),
        describe("destination_status"),
        describe("time_status"),
    );

    Ok(Patch::new()
        .control_value("document_status", documents)
        .flag(VALIDATION_COMPLETED, true)
        .status(Phase::Processing)
        .say(summary))
}

pub fn start_parallel(_state: &ExecutionState) -> anyhow::Result<Patch> {
    Ok(Patch::new().say("Looking up flights, hotels and attractions..."))
}

// ---------------------------------------------------------------------------
// parallel lookups
// ---------------------------------------------------------------------------

pub async fn query_flights(state: ExecutionState, ctx: NodeContext) -> anyhow::Result<Patch> {
    let info = travel_info(&state)?;
    tokio::task::yield_now().await;
    let quote: FlightQuote =
        catalog::quote_flight(&info.destination, info.travel_date.as_deref(), &info.requirements);
    debug!(node = %ctx.node, price = quote.price, "flight quote");
    Ok(Patch::new().set(FLIGHT_INFO, serde_json::to_value(quote)?))
}

pub async fn query_hotels(state: ExecutionState, ctx: NodeContext) -> anyhow::Result<Patch> {
    let info = travel_info(&state)?;
    tokio::task::yield_now().await;
    let quote: HotelQuote = catalog::quote_hotel(&info.destination, info.days, &info.requirements);
    debug!(node = %ctx.node, total = quote.total_price, "hotel quote");
    Ok(Patch::new().set(HOTEL_INFO, serde_json::to_value(quote)?))
}

pub async fn query_attractions(state: ExecutionState, ctx: NodeContext) -> anyhow::Result<Patch> {
    let info = travel_info(&state)?;
    tokio::task::yield_now().await;
    let list: AttractionList = catalog::list_attractions(&info.destination, info.days);
    debug!(node = %ctx.node, count = list.attractions.len(), "attractions listed");
    Ok(Patch::new().set(ATTRACTIONS_INFO, serde_json::to_value(list)?))
}

/// Substitute outputs used when a lookup fails or times out.
pub fn lookup_fallbacks() -> [(&'static str, Patch); 3] {
    [
        ("query_flights", Patch::new().set(FLIGHT_INFO, json!({"price": 0}))),
        ("query_hotels", Patch::new().set(HOTEL_INFO, json!({"total_price": 0}))),
        ("query_attractions", Patch::new().set(ATTRACTIONS_INFO, json!({"attractions": []}))),
    ]
}

fn price_of(value: Option<&Value>, key: &str) -> f64 {
    value.and_then(|v| v.get(key)).and_then(Value::as_f64).unwrap_or(0.0)
}

pub fn aggregate_results(state: &ExecutionState) -> anyhow::Result<Patch> {
    let flight = state.get(FLIGHT_INFO).cloned().unwrap_or_else(|| json!({}));
    let hotel = state.get(HOTEL_INFO).cloned().unwrap_or_else(|| json!({}));
    let attractions = state.get(ATTRACTIONS_INFO).cloned().unwrap_or_else(|| json!({}));

    let count = attractions
        .get("attractions")
        .and_then(Value::as_array)
        .map_or(0, Vec::len);
    let message = format!(
        "Lookups complete. Flight: {:.0}, hotel: {:.0}, {count} attractions.",
        price_of(Some(&flight), "price"),
        price_of(Some(&hotel), "total_price"),
    );

    Ok(Patch::new()
        .set(
            QUERY_RESULTS,
            json!({"flight": flight, "hotel": hotel, "attractions": attractions}),
        )
        .say(message))
}

// ---------------------------------------------------------------------------
// budget loop
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostAnalysis {
    pub total_cost: f64,
    pub budget: f64,
    pub is_over_budget: bool,
    pub budget_remaining: f64,
    pub cost_breakdown: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_adjustment: Option<Value>,
}

impl CostAnalysis {
    pub fn estimate(info: &TravelInfo, query_results: Option<&Value>) -> Self {
        let flight = price_of(query_results.and_then(|q| q.get("flight")), "price");
        let hotel = price_of(query_results.and_then(|q| q.get("hotel")), "total_price");
        let daily = f64::from(catalog::daily_expense(&info.destination) * info.days);

        let breakdown = BTreeMap::from([
            ("flight".to_string(), flight),
            ("hotel".to_string(), hotel),
            ("daily".to_string(), daily),
            ("other".to_string(), OTHER_COSTS),
        ]);
        Self::from_breakdown(breakdown, info.budget)
    }

    fn from_breakdown(cost_breakdown: BTreeMap<String, f64>, budget: f64) -> Self {
        let total_cost: f64 = cost_breakdown.values().sum();
        Self {
            total_cost,
            budget,
            is_over_budget: total_cost > budget,
            budget_remaining: budget - total_cost,
            cost_breakdown,
            human_adjustment: None,
        }
    }
}

fn minimum_cost(item: &str, original: f64) -> f64 {
    match item {
        "flight" => 300.0,
        "hotel" => 100.0,
        "daily" => 80.0,
        "other" => 50.0,
        _ => original * 0.3,
    }
}

fn is_luxury(info: &TravelInfo) -> bool {
    info.requirements
        .iter()
        .any(|r| matches!(r.as_str(), "luxury" | "five-star" | "first class"))
}

/// One pass of the budget loop: estimate on first entry, then cut costs.
pub fn optimize_budget(policy: &LoopPolicy, state: &ExecutionState) -> anyhow::Result<Patch> {
    let info = travel_info(state)?;
    let attempts = policy.attempts(state) + 1;
    let mut patch = policy.bump(state);

    let analysis = match state.get_as::<CostAnalysis>(COST_ANALYSIS) {
        Some(existing) => existing,
        None => {
            let estimate = CostAnalysis::estimate(&info, state.get(QUERY_RESULTS));
            info!(
                total = estimate.total_cost,
                budget = estimate.budget,
                over = estimate.is_over_budget,
                "cost estimated"
            );
            if !estimate.is_over_budget {
                return Ok(patch
                    .set(COST_ANALYSIS, serde_json::to_value(&estimate)?)
                    .flag(policy.satisfied_flag(), true)
                    .say(format!(
                        "Estimated cost {:.0} fits the budget of {:.0}.",
                        estimate.total_cost, estimate.budget
                    )));
            }
            estimate
        }
    };

    let budget = info.budget;
    let total = analysis.total_cost;
    let over = total - budget;

    if total > budget * 5.0 {
        info!(total, budget, "budget far too small, escalating");
        return Ok(patch
            .set(COST_ANALYSIS, serde_json::to_value(&analysis)?)
            .flag(policy.escalate_flag(), true)
            .say(format!(
                "The trip needs about {total:.0} but the budget is {budget:.0}; at least {:.0} is recommended.",
                total * 0.7
            )));
    }

    let luxury = is_luxury(&info) && over > budget * 0.5;
    let shares: [f64; 3] = if luxury {
        [0.15, 0.10, 0.05]
    } else {
        [0.4, 0.3, 0.3]
    };
    let savings: f64 = shares.iter().map(|s| over * s).sum();
    let rate = if total > 0.0 { savings / total } else { 0.0 };

    let breakdown: BTreeMap<String, f64> = analysis
        .cost_breakdown
        .iter()
        .map(|(item, cost)| {
            let reduced = (cost * (1.0 - rate)).floor();
            (item.clone(), reduced.max(minimum_cost(item, *cost)))
        })
        .collect();
    let optimized = CostAnalysis::from_breakdown(breakdown, budget);
    let satisfied = !optimized.is_over_budget;

    info!(
        attempt = attempts,
        from = total,
        to = optimized.total_cost,
        satisfied,
        "budget optimisation pass"
    );

    if satisfied {
        patch = patch.flag(policy.satisfied_flag(), true);
    } else if optimized.total_cost > budget * 2.0 || (luxury && attempts >= 3) {
        patch = patch.flag(policy.escalate_flag(), true);
    }

    let message = format!(
        "Optimisation pass {attempts}: cost {total:.0} -> {:.0} (budget {budget:.0}).",
        optimized.total_cost
    );
    Ok(patch
        .set(COST_ANALYSIS, serde_json::to_value(&optimized)?)
        .status(Phase::Optimizing)
        .say(message))
}

/// Quality check for an exhausted budget loop.
pub fn still_over_budget(state: &ExecutionState) -> bool {
    state
        .get_as::<CostAnalysis>(COST_ANALYSIS)
        .is_some_and(|c| c.is_over_budget)
}

// ---------------------------------------------------------------------------
// itinerary loop
// ---------------------------------------------------------------------------

pub const TARGET_SCORE: f64 = 0.85;

pub fn itinerary_score(attempts: u32) -> f64 {
    (0.6 + 0.15 * f64::from(attempts)).min(0.95)
}

pub fn optimize_itinerary(policy: &LoopPolicy, state: &ExecutionState) -> anyhow::Result<Patch> {
    let attempts = policy.attempts(state) + 1;
    let score = itinerary_score(attempts);
    let mut patch = policy
        .bump(state)
        .control_value("itinerary_score", score)
        .status(Phase::Optimizing);
    if score >= TARGET_SCORE {
        patch = patch.flag(policy.satisfied_flag(), true);
    }
    debug!(attempt = attempts, score, "itinerary optimisation pass");
    Ok(patch.say(format!("Itinerary pass {attempts}: score {score:.2}.")))
}

pub fn itinerary_needs_review(state: &ExecutionState) -> bool {
    let score = state
        .control
        .value("itinerary_score")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    score < 0.7 || still_over_budget(state)
}

// ---------------------------------------------------------------------------
// output
// ---------------------------------------------------------------------------

pub fn generate_itinerary(state: &ExecutionState) -> anyhow::Result<Patch> {
    let info = travel_info(state)?;
    let cost = state.get_as::<CostAnalysis>(COST_ANALYSIS);
    let total = cost.as_ref().map_or(0.0, |c| c.total_cost);
    let results = state.get(QUERY_RESULTS);

    let mut lines = vec![
        format!("# {} in {} days", info.destination, info.days),
        format!("Budget: {:.0}, estimated cost: {total:.0}", info.budget),
    ];
    if let Some(flight) = results.and_then(|r| r.get("flight")) {
        lines.push(format!("Flight: {:.0}", price_of(Some(flight), "price")));
    }
    if let Some(hotel) = results.and_then(|r| r.get("hotel")) {
        let name = hotel
            .get("recommended")
            .and_then(Value::as_str)
            .unwrap_or("local hotel");
        lines.push(format!("Hotel: {name}, {:.0}", price_of(Some(hotel), "total_price")));
    }
    let plans: Vec<String> = results
        .and_then(|r| r.pointer("/attractions/daily_plans"))
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();
    lines.extend(plans);
    if state.control.flag(OVER_BUDGET_ACCEPTED) {
        lines.push("Note: this plan exceeds the budget by your choice.".to_string());
    }

    let itinerary = lines.join("\n");
    Ok(Patch::new()
        .set(ITINERARY, itinerary.clone())
        .status(Phase::Completed)
        .say(format!("Your itinerary is ready.\n\n{itinerary}")))
}
