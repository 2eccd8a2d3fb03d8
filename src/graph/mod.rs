// src/graph/mod.rs

//! Workflow graph definition.
//!
//! - [`handler`]: the `NodeHandler` trait and closure adapters.
//! - [`route`]: routers, conditional-edge targets and the `Route` a step
//!   resolves to.
//! - [`spec`]: `GraphBuilder` and the validated, immutable `GraphSpec`.

pub mod handler;
pub mod route;
pub mod spec;

pub use handler::{async_handler, handler_fn, HandlerFuture, NodeContext, NodeHandler};
pub use route::{Route, Router, Target, END};
pub use spec::{Edges, GraphBuilder, GraphSpec, NodeEntry};
