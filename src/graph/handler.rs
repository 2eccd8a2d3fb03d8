// src/graph/handler.rs

//! Node handler abstraction.
//!
//! The driver talks to an `Arc<dyn NodeHandler>` instead of a concrete
//! function type, so synchronous closures, async closures and stateful
//! structs (mock services, LLM clients) all plug in the same way.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::state::{ExecutionState, Patch};

/// Future returned by [`NodeHandler::run`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<Patch>> + Send + 'a>>;

/// Per-invocation context handed to a handler.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub run_id: String,
    pub node: String,
    /// Step number the handler's output will be checkpointed under.
    pub step: u64,
    /// Cancelled when the branch or its fan-out group times out.
    pub cancel: CancellationToken,
}

impl NodeContext {
    pub fn new(run_id: impl Into<String>, node: impl Into<String>, step: u64) -> Self {
        Self {
            run_id: run_id.into(),
            node: node.into(),
            step,
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// One named step of a graph.
///
/// A handler reads the pre-step state and returns a [`Patch`]; it never
/// mutates the state directly. Errors are reported through `anyhow` and
/// classified by the driver.
pub trait NodeHandler: Send + Sync {
    fn run<'a>(&'a self, state: &'a ExecutionState, ctx: &'a NodeContext) -> HandlerFuture<'a>;
}

/// Handler backed by a synchronous closure.
///
/// The closure runs on Tokio's blocking pool, so the returned future stays
/// pending while it works and a branch timeout can replace a slow result.
pub struct FnHandler<F> {
    f: Arc<F>,
}

impl<F> NodeHandler for FnHandler<F>
where
    F: Fn(&ExecutionState) -> anyhow::Result<Patch> + Send + Sync + 'static,
{
    fn run<'a>(&'a self, state: &'a ExecutionState, ctx: &'a NodeContext) -> HandlerFuture<'a> {
        let f = Arc::clone(&self.f);
        let state = state.clone();
        let node = ctx.node.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || (*f)(&state))
                .await
                .map_err(|e| anyhow::anyhow!("handler for '{node}' panicked: {e}"))?
        })
    }
}

/// Wrap a synchronous closure as a node handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn NodeHandler>
where
    F: Fn(&ExecutionState) -> anyhow::Result<Patch> + Send + Sync + 'static,
{
    Arc::new(FnHandler { f: Arc::new(f) })
}

/// Handler backed by an async closure that owns its inputs.
pub struct AsyncFnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> NodeHandler for AsyncFnHandler<F, Fut>
where
    F: Fn(ExecutionState, NodeContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Patch>> + Send + 'static,
{
    fn run<'a>(&'a self, state: &'a ExecutionState, ctx: &'a NodeContext) -> HandlerFuture<'a> {
        // Clone so the returned future doesn't borrow the caller's snapshot.
        Box::pin((self.f)(state.clone(), ctx.clone()))
    }
}

/// Wrap an async closure as a node handler.
///
/// The closure receives an owned copy of the state and context, which is
/// what a handler that awaits external services usually wants.
pub fn async_handler<F, Fut>(f: F) -> Arc<dyn NodeHandler>
where
    F: Fn(ExecutionState, NodeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Patch>> + Send + 'static,
{
    Arc::new(AsyncFnHandler {
        f,
        _fut: PhantomData,
    })
}
