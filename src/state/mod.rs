// src/state/mod.rs

//! Shared run state and its merge protocol.
//!
//! - [`model`] defines `ExecutionState` with its reserved fields
//!   (`messages`, `control`, `status`) and the open `data` map.
//! - [`merge`] defines the `Patch` a node returns and how patches, including
//!   the concurrent patches of a fan-out group, are folded into the state.

pub mod merge;
pub mod model;

pub use merge::{merge_fanout, BranchPatch, ControlPatch, MergeConflict, Patch};
pub use model::{ControlBlock, ExecutionState, Message, Phase, PhaseClass, Role};
