#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use stepflow::checkpoint::{CheckpointStore, MemoryStore};
use stepflow::config::{ConfigFile, RawConfigFile};
use stepflow::engine::{Engine, EngineOptions};
use stepflow::graph::{async_handler, handler_fn, GraphSpec, NodeHandler};
use stepflow::state::{Patch, Phase};
use stepflow::types::StoreMode;

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile::default(),
        }
    }

    pub fn max_steps(mut self, n: u64) -> Self {
        self.config.engine.max_steps = n;
        self
    }

    pub fn timeouts_ms(mut self, branch: u64, group: u64) -> Self {
        self.config.engine.branch_timeout_ms = branch;
        self.config.engine.fanout_timeout_ms = group;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.loops.max_attempts = n;
        self
    }

    pub fn memory_store(mut self) -> Self {
        self.config.store.mode = StoreMode::Memory;
        self
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Engine options with short timeouts, suitable for tests.
pub fn test_options() -> EngineOptions {
    EngineOptions {
        max_steps: 100,
        branch_timeout: Duration::from_millis(500),
        fanout_timeout: Duration::from_secs(2),
    }
}

pub fn engine_with(graph: GraphSpec, store: Arc<dyn CheckpointStore>) -> Engine {
    Engine::new(Arc::new(graph), store, test_options())
}

pub fn memory_engine(graph: GraphSpec) -> (Engine, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_with(graph, store.clone());
    (engine, store)
}

/// Node that writes `key = value`.
pub fn writer(key: &str, value: impl Into<Value>) -> Arc<dyn NodeHandler> {
    let key = key.to_string();
    let value = value.into();
    handler_fn(move |_| Ok(Patch::new().set(key.clone(), value.clone())))
}

/// Node that sleeps, then writes `key = value`.
pub fn slow_writer(delay: Duration, key: &str, value: impl Into<Value>) -> Arc<dyn NodeHandler> {
    let key = key.to_string();
    let value = value.into();
    async_handler(move |_state, _ctx| {
        let key = key.clone();
        let value = value.clone();
        async move {
            tokio::time::sleep(delay).await;
            Ok(Patch::new().set(key, value))
        }
    })
}

/// Node that always fails with `message`.
pub fn failing(message: &str) -> Arc<dyn NodeHandler> {
    let message = message.to_string();
    handler_fn(move |_| Err(anyhow::anyhow!("{message}")))
}

/// Node that moves the run to `status`.
pub fn set_status(status: Phase) -> Arc<dyn NodeHandler> {
    handler_fn(move |_| Ok(Patch::new().status(status)))
}

/// Counts its invocations and returns the patch built from the count.
pub struct CountingNode {
    pub calls: Arc<AtomicUsize>,
}

impl CountingNode {
    pub fn handler<F>(f: F) -> (Arc<dyn NodeHandler>, Arc<AtomicUsize>)
    where
        F: Fn(usize) -> Patch + Send + Sync + 'static,
    {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler = handler_fn(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(f(n))
        });
        (handler, calls)
    }
}
