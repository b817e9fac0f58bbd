// In-memory MemoryStore for development and testing

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::store::{MemoryItem, MemoryStore, StoreReceipt};
use crate::error::{OrchestratorError, Result};

#[derive(Default)]
struct StoreState {
    items: BTreeMap<String, MemoryItem>,
    /// Item count of every call, in call order
    calls: Vec<usize>,
    /// Zero-based call numbers that fail outright
    failing_calls: HashSet<usize>,
    fail_all: bool,
    /// Ids accepted but never acknowledged
    withheld: HashSet<String>,
    in_flight: usize,
    peak_in_flight: usize,
}

/// Store that keeps items in a map, with injectable failures
#[derive(Default)]
pub struct InMemoryMemoryStore {
    state: Mutex<StoreState>,
    latency: Option<Duration>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every call, so concurrent calls overlap
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the given zero-based call number
    pub fn fail_call(&self, call: usize) {
        self.state.lock().failing_calls.insert(call);
    }

    /// Fail every call until cleared
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().fail_all = unavailable;
    }

    /// Silently drop `id` from the next call that carries it: the item is
    /// neither stored nor acknowledged. Applies once.
    pub fn withhold(&self, id: impl Into<String>) {
        self.state.lock().withheld.insert(id.into());
    }

    pub fn stored_count(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn stored(&self) -> Vec<MemoryItem> {
        self.state.lock().items.values().cloned().collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.lock().items.contains_key(id)
    }

    /// Item count of every call made so far
    pub fn call_sizes(&self) -> Vec<usize> {
        self.state.lock().calls.clone()
    }

    /// Most calls observed running at once
    pub fn peak_concurrency(&self) -> usize {
        self.state.lock().peak_in_flight
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn batch_store(&self, items: Vec<MemoryItem>) -> Result<StoreReceipt> {
        let call = {
            let mut state = self.state.lock();
            state.calls.push(items.len());
            state.in_flight += 1;
            state.peak_in_flight = state.peak_in_flight.max(state.in_flight);
            state.calls.len() - 1
        };

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        state.in_flight -= 1;
        if state.fail_all || state.failing_calls.contains(&call) {
            return Err(OrchestratorError::Store(format!("injected failure on call {call}")));
        }

        let mut stored_ids = Vec::with_capacity(items.len());
        for item in items {
            if state.withheld.remove(&item.id) {
                continue;
            }
            stored_ids.push(item.id.clone());
            state.items.insert(item.id.clone(), item);
        }
        Ok(StoreReceipt { stored_ids })
    }

    fn name(&self) -> &'static str {
        "InMemoryMemoryStore"
    }
}
