//! Common test utilities for attachment-dl integration tests

#![allow(dead_code)]

use std::sync::Arc;

use attachment_dl::{Config, Event, InMemoryStore, Orchestrator, WorkerConfig};
use tokio::sync::broadcast;

/// Configuration from environment-style pairs, as a deployment would set them
pub fn config_from(pairs: &[(&str, &str)]) -> Config {
    Config::from_vars(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())))
        .expect("test configuration is valid")
}

/// Orchestrator over a shared in-memory store that the test can inspect
pub fn orchestrator_with(config: Config) -> (Arc<InMemoryStore>, Orchestrator) {
    let store = Arc::new(InMemoryStore::new());
    let orchestrator =
        Orchestrator::new(config, store.clone()).expect("orchestrator initializes");
    (store, orchestrator)
}

/// `WORKER_LIST` value with `n` direct workers
pub fn direct_workers(n: usize) -> String {
    serde_json::to_string(&vec![WorkerConfig::direct(); n]).expect("worker list serializes")
}

/// Everything currently buffered on an event receiver
pub fn drain(events: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    std::iter::from_fn(|| events.try_recv().ok()).collect()
}
