// src/workflow/gate.rs

//! Human-intervention gate.
//!
//! The gate runs when a loop escalates. On first entry it writes the
//! options and suspends at `waiting_confirmation`. When it runs again with
//! a decision in `control.values["decision"]` it applies that decision:
//!
//! - `accept`: the total cost is reduced by a rate picked from the
//!   overspend ratio, then the run continues.
//! - `keep`: the cost is left alone and `over_budget_accepted` is set.
//! - `terminate`: the run ends in `terminated`.
//!
//! Non-interactive runs never suspend here; they take `accept`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::graph::{HandlerFuture, NodeContext, NodeHandler};
use crate::state::{ExecutionState, Message, Patch, Phase};

/// `control.values` key carrying the external decision.
pub const DECISION_KEY: &str = "decision";
/// Flag set by a `keep` decision.
pub const OVER_BUDGET_ACCEPTED: &str = "over_budget_accepted";
/// Flag set once the gate has applied a decision.
pub const INTERVENTION_COMPLETED: &str = "human_intervention_completed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Accept,
    Keep,
    Terminate,
}

impl Decision {
    pub const ALL: [Decision; 3] = [Decision::Accept, Decision::Keep, Decision::Terminate];

    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Accept => "accept",
            Decision::Keep => "keep",
            Decision::Terminate => "terminate",
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Decision::Accept => "accept the optimised plan",
            Decision::Keep => "keep the current plan over budget",
            Decision::Terminate => "stop planning",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "accept" | "1" => Ok(Decision::Accept),
            "keep" | "2" => Ok(Decision::Keep),
            "terminate" | "reject" | "3" => Ok(Decision::Terminate),
            other => Err(format!(
                "invalid decision: {other} (expected accept, keep or terminate)"
            )),
        }
    }
}

/// Reduction applied by `accept`, by overspend ratio.
pub fn reduction_rate(total_cost: f64, budget: f64) -> f64 {
    let ratio = if budget > 0.0 {
        (total_cost - budget) / budget
    } else {
        f64::INFINITY
    };
    if ratio > 0.3 {
        0.25
    } else if ratio > 0.2 {
        0.20
    } else {
        0.15
    }
}

fn suggestions(total_cost: f64, budget: f64) -> Vec<String> {
    let over = total_cost - budget;
    let rate = reduction_rate(total_cost, budget);
    let advice = if rate >= 0.25 {
        "adjust the destination or shorten the trip"
    } else if rate >= 0.20 {
        "choose economy hotels and off-peak flights"
    } else {
        "trim the shopping budget and pick free attractions"
    };
    vec![
        format!("currently {over:.0} over budget"),
        format!("suggestion: {advice}"),
        format!("expected saving: {:.0}%", rate * 100.0),
    ]
}

/// Gate node reading `{ total_cost, budget }` from a data key.
#[derive(Debug, Clone)]
pub struct HumanGate {
    cost_key: String,
}

impl HumanGate {
    pub fn new(cost_key: impl Into<String>) -> Self {
        Self {
            cost_key: cost_key.into(),
        }
    }

    fn pending_decision(&self, state: &ExecutionState) -> (Option<Decision>, Option<String>) {
        match state.control.value(DECISION_KEY) {
            None | Some(Value::Null) => (None, None),
            Some(Value::String(raw)) => match raw.parse() {
                Ok(d) => (Some(d), None),
                Err(e) => (None, Some(e)),
            },
            Some(other) => (None, Some(format!("invalid decision value: {other}"))),
        }
    }

    /// Compute the gate's patch for `state`.
    pub fn evaluate(&self, state: &ExecutionState) -> anyhow::Result<Patch> {
        let cost = state.get(&self.cost_key).cloned().unwrap_or_else(|| json!({}));
        let total_cost = cost.get("total_cost").and_then(Value::as_f64).unwrap_or(0.0);
        let budget = cost.get("budget").and_then(Value::as_f64).unwrap_or(0.0);

        let (mut decision, invalid) = self.pending_decision(state);
        if decision.is_none() && !state.control.interactive {
            info!("non-interactive run: accepting optimisation automatically");
            decision = Some(Decision::Accept);
        }

        let Some(decision) = decision else {
            return Ok(self.ask(total_cost, budget, invalid));
        };

        info!(%decision, total_cost, budget, "applying intervention decision");
        let patch = Patch::new()
            .control_value(DECISION_KEY, Value::Null)
            .flag(INTERVENTION_COMPLETED, true);

        Ok(match decision {
            Decision::Accept => {
                let rate = reduction_rate(total_cost, budget);
                let adjusted = total_cost * (1.0 - rate);
                let mut updated = cost.clone();
                if let Value::Object(map) = &mut updated {
                    map.insert("total_cost".into(), json!(adjusted));
                    map.insert("is_over_budget".into(), json!(adjusted > budget));
                    map.insert(
                        "human_adjustment".into(),
                        json!({
                            "original_total": total_cost,
                            "adjusted_total": adjusted,
                            "reduction_rate": rate,
                        }),
                    );
                }
                patch
                    .set(self.cost_key.clone(), updated)
                    .status(Phase::Planning)
                    .say(format!(
                        "Optimisation applied: total cost reduced by {:.0}% from {total_cost:.0} to {adjusted:.0}.",
                        rate * 100.0
                    ))
            }
            Decision::Keep => patch
                .flag(OVER_BUDGET_ACCEPTED, true)
                .status(Phase::Planning)
                .say(format!(
                    "Keeping the current plan: total {total_cost:.0} against a budget of {budget:.0}."
                )),
            Decision::Terminate => patch
                .status(Phase::Terminated)
                .say("Planning stopped at your request. Adjust the budget or the request and start again."),
        })
    }

    fn ask(&self, total_cost: f64, budget: f64, invalid: Option<String>) -> Patch {
        let suggestions = suggestions(total_cost, budget);
        let options: Vec<&str> = Decision::ALL.iter().map(|d| d.as_str()).collect();

        let mut text = format!(
            "The plan costs {total_cost:.0} against a budget of {budget:.0}.\n{}\nReply with one of:",
            suggestions.join("\n")
        );
        for (i, d) in Decision::ALL.iter().enumerate() {
            text.push_str(&format!("\n  {}. {} ({})", i + 1, d.as_str(), d.describe()));
        }

        let mut patch = Patch::new()
            .control_value("suggestions", json!(suggestions))
            .control_value("accepted_inputs", json!(options))
            .control_value(DECISION_KEY, Value::Null)
            .status(Phase::WaitingConfirmation)
            .say(text);

        if let Some(msg) = invalid {
            warn!(error = %msg, "ignoring unrecognised decision");
            patch = patch.message(Message::system(msg));
        }
        patch
    }
}

impl NodeHandler for HumanGate {
    fn run<'a>(&'a self, state: &'a ExecutionState, _ctx: &'a NodeContext) -> HandlerFuture<'a> {
        let result = self.evaluate(state);
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn over_budget_state(total: f64, budget: f64, interactive: bool) -> ExecutionState {
        let mut state = ExecutionState::from_request("trip", interactive);
        state.apply(Patch::new().set(
            "cost_analysis",
            json!({"total_cost": total, "budget": budget, "is_over_budget": total > budget}),
        ));
        state
    }

    fn with_decision(mut state: ExecutionState, decision: &str) -> ExecutionState {
        state.apply(Patch::new().control_value(DECISION_KEY, decision));
        state
    }

    #[test]
    fn reduction_tiers_follow_overspend_ratio() {
        assert_eq!(reduction_rate(14000.0, 10000.0), 0.25);
        assert_eq!(reduction_rate(12500.0, 10000.0), 0.20);
        assert_eq!(reduction_rate(11000.0, 10000.0), 0.15);
        assert_eq!(reduction_rate(500.0, 0.0), 0.25);
    }

    #[test]
    fn parses_decisions_and_menu_numbers() {
        assert_eq!("Accept".parse::<Decision>(), Ok(Decision::Accept));
        assert_eq!("2".parse::<Decision>(), Ok(Decision::Keep));
        assert_eq!("reject".parse::<Decision>(), Ok(Decision::Terminate));
        assert!("maybe".parse::<Decision>().is_err());
    }

    #[test]
    fn interactive_first_entry_waits_for_confirmation() {
        let gate = HumanGate::new("cost_analysis");
        let patch = gate.evaluate(&over_budget_state(14000.0, 10000.0, true)).unwrap();
        assert_eq!(patch.status, Some(Phase::WaitingConfirmation));
        assert_eq!(
            patch.control.values.get("accepted_inputs"),
            Some(&json!(["accept", "keep", "terminate"]))
        );
    }

    #[test]
    fn accept_reduces_cost() {
        let gate = HumanGate::new("cost_analysis");
        let state = with_decision(over_budget_state(14000.0, 10000.0, true), "accept");
        let patch = gate.evaluate(&state).unwrap();

        assert_eq!(patch.status, Some(Phase::Planning));
        let cost = patch.data.get("cost_analysis").unwrap();
        assert_eq!(cost["total_cost"], json!(10500.0));
        assert_eq!(cost["is_over_budget"], json!(true));
        assert_eq!(patch.control.values.get(DECISION_KEY), Some(&Value::Null));
    }

    #[test]
    fn keep_sets_the_over_budget_flag() {
        let gate = HumanGate::new("cost_analysis");
        let state = with_decision(over_budget_state(11000.0, 10000.0, true), "keep");
        let patch = gate.evaluate(&state).unwrap();
        assert_eq!(patch.status, Some(Phase::Planning));
        assert_eq!(patch.control.flags.get(OVER_BUDGET_ACCEPTED), Some(&true));
        assert!(!patch.data.contains_key("cost_analysis"));
    }

    #[test]
    fn terminate_ends_the_run() {
        let gate = HumanGate::new("cost_analysis");
        let state = with_decision(over_budget_state(11000.0, 10000.0, true), "terminate");
        assert_eq!(gate.evaluate(&state).unwrap().status, Some(Phase::Terminated));
    }

    #[test]
    fn non_interactive_auto_accepts() {
        let gate = HumanGate::new("cost_analysis");
        let patch = gate.evaluate(&over_budget_state(11000.0, 10000.0, false)).unwrap();
        assert_eq!(patch.status, Some(Phase::Planning));
        let cost = patch.data.get("cost_analysis").unwrap();
        assert_eq!(cost["total_cost"], json!(9350.0));
    }

    #[test]
    fn invalid_decision_asks_again() {
        let gate = HumanGate::new("cost_analysis");
        let state = with_decision(over_budget_state(11000.0, 10000.0, true), "maybe");
        let patch = gate.evaluate(&state).unwrap();
        assert_eq!(patch.status, Some(Phase::WaitingConfirmation));
        assert!(patch.messages.iter().any(|m| m.content.contains("invalid decision")));
    }
}
