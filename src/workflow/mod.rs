// src/workflow/mod.rs

//! Reusable control-flow patterns built from ordinary nodes and routers.

pub mod gate;
pub mod looping;

pub use gate::{reduction_rate, Decision, HumanGate};
pub use looping::{LoopDecision, LoopPolicy};
