//! Result aggregation and sync to the external memory store
//!
//! [`MemoryAggregator`] subscribes to `task.completed` and keeps a dirty set
//! of pools with uncollected results. Each sync cycle, for every dirty pool:
//!
//! 1. drain the pool's results through a [`ResultSource`]
//! 2. prepend items left over from earlier failed chunks
//! 3. send them in chunks of `batch_size`, at most `max_concurrent_batches`
//!    in flight, every call guarded by the store's circuit breaker
//! 4. keep whatever the store did not acknowledge for the next cycle
//!
//! A pool leaves the dirty set only when every chunk of the cycle succeeded
//! and no new completion arrived while it was being synced.

mod http;
mod in_memory;
mod store;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::bus::{BusMessage, Subscriber};
use crate::error::{OrchestratorError, Result};
use crate::metrics::OrchestratorMetrics;
use crate::reliability::{CircuitBreaker, CircuitBreakerConfig};
use crate::types::{PoolId, ResultBatch};

pub use http::HttpMemoryStore;
pub use in_memory::InMemoryMemoryStore;
pub use store::{MemoryItem, MemoryStore, StoreReceipt};

/// Breaker key for store calls
pub const STORE_BREAKER_KEY: &str = "memory-store";

// ============================================================================
// Configuration
// ============================================================================

/// Sync settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregatorConfig {
    /// Time between sync cycles
    #[serde(with = "crate::config::duration_millis")]
    pub interval: Duration,

    /// Items per store call
    pub batch_size: usize,

    /// Store calls in flight at once
    pub max_concurrent_batches: usize,

    /// Start a cycle as soon as a pool turns dirty instead of waiting for the
    /// next tick
    pub event_driven: bool,

    /// Breaker guarding the store
    pub store_breaker: CircuitBreakerConfig,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 20,
            max_concurrent_batches: 4,
            event_driven: false,
            store_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl AggregatorConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_concurrent_batches(mut self, max: usize) -> Self {
        self.max_concurrent_batches = max;
        self
    }

    pub fn with_event_driven(mut self, event_driven: bool) -> Self {
        self.event_driven = event_driven;
        self
    }

    pub fn with_store_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.store_breaker = config;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(OrchestratorError::Config(
                "sync batch_size must be at least 1".into(),
            ));
        }
        if self.max_concurrent_batches == 0 {
            return Err(OrchestratorError::Config(
                "sync max_concurrent_batches must be at least 1".into(),
            ));
        }
        if self.interval.is_zero() {
            return Err(OrchestratorError::Config(
                "sync interval must be positive".into(),
            ));
        }
        self.store_breaker.validate()
    }
}

// ============================================================================
// Seams
// ============================================================================

/// Where the aggregator drains results from
#[async_trait]
pub trait ResultSource: Send + Sync {
    /// Return and clear the pool's uncollected results
    async fn collect_results(&self, pool_id: &PoolId) -> Result<ResultBatch>;
}

/// Receives results drained by someone other than the aggregator, so they
/// still reach the store
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn accept(&self, batch: ResultBatch);
}

// ============================================================================
// Reports
// ============================================================================

/// Outcome of one sync cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Pools fully synced and removed from the dirty set
    pub pools_synced: usize,
    /// Pools still dirty after the cycle
    pub pools_pending: usize,
    pub chunks_sent: usize,
    pub chunks_failed: usize,
    pub items_stored: usize,
    /// Items kept for the next cycle
    pub items_carried: usize,
}

#[derive(Default)]
struct PoolSync {
    chunks_sent: usize,
    chunks_failed: usize,
    items_stored: usize,
    leftover: Vec<MemoryItem>,
}

struct ChunkOutcome {
    stored: usize,
    /// Items the store failed or declined to acknowledge
    leftover: Vec<MemoryItem>,
    failed: bool,
}

#[derive(Default)]
struct SyncState {
    /// Dirty pools with the epoch of their latest mark
    dirty: HashMap<PoolId, u64>,
    /// Items already drained from a pool but not yet stored
    carry: HashMap<PoolId, Vec<MemoryItem>>,
}

// ============================================================================
// MemoryAggregator
// ============================================================================

pub struct MemoryAggregator {
    config: AggregatorConfig,
    source: Arc<dyn ResultSource>,
    store: Arc<dyn MemoryStore>,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<OrchestratorMetrics>,
    state: Mutex<SyncState>,
    epoch: AtomicU64,
    wake: Notify,
    /// One cycle at a time
    cycle: tokio::sync::Mutex<()>,
}

impl MemoryAggregator {
    pub fn new(
        config: AggregatorConfig,
        source: Arc<dyn ResultSource>,
        store: Arc<dyn MemoryStore>,
        metrics: Arc<OrchestratorMetrics>,
    ) -> Self {
        let breaker = Arc::new(
            CircuitBreaker::new(STORE_BREAKER_KEY, config.store_breaker.clone())
                .with_metrics(Arc::clone(&metrics)),
        );
        Self {
            config,
            source,
            store,
            breaker,
            metrics,
            state: Mutex::new(SyncState::default()),
            epoch: AtomicU64::new(0),
            wake: Notify::new(),
            cycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Record that `pool_id` has results to sync
    pub fn mark_dirty(&self, pool_id: PoolId) {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.state.lock().dirty.insert(pool_id, epoch);
        if self.config.event_driven {
            self.wake.notify_one();
        }
    }

    pub fn is_dirty(&self, pool_id: &PoolId) -> bool {
        self.state.lock().dirty.contains_key(pool_id)
    }

    /// Dirty pools, sorted
    pub fn dirty_pools(&self) -> Vec<PoolId> {
        let mut pools: Vec<PoolId> = self.state.lock().dirty.keys().cloned().collect();
        pools.sort();
        pools
    }

    /// Items waiting to be resent
    pub fn carried_items(&self) -> usize {
        self.state.lock().carry.values().map(Vec::len).sum()
    }

    /// Run one sync cycle over every dirty pool
    #[instrument(skip(self))]
    pub async fn sync_once(&self) -> SyncReport {
        let _cycle = self.cycle.lock().await;

        let mut dirty: Vec<(PoolId, u64)> = self
            .state
            .lock()
            .dirty
            .iter()
            .map(|(pool_id, epoch)| (pool_id.clone(), *epoch))
            .collect();
        dirty.sort();

        let mut report = SyncReport::default();
        for (pool_id, epoch) in dirty {
            let outcome = match self.sync_pool(&pool_id).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(pool_id = %pool_id, error = %e, "Result collection failed, pool stays dirty");
                    report.pools_pending += 1;
                    continue;
                }
            };

            report.chunks_sent += outcome.chunks_sent;
            report.chunks_failed += outcome.chunks_failed;
            report.items_stored += outcome.items_stored;
            report.items_carried += outcome.leftover.len();

            let mut state = self.state.lock();
            if outcome.leftover.is_empty() {
                // A mark newer than the one this cycle started from keeps it dirty
                if state.dirty.get(&pool_id) == Some(&epoch) {
                    state.dirty.remove(&pool_id);
                    report.pools_synced += 1;
                } else {
                    report.pools_pending += 1;
                }
            } else {
                let err = OrchestratorError::SyncPartialFailure {
                    pool_id: pool_id.clone(),
                    failed_chunks: outcome.chunks_failed,
                    failed_items: outcome.leftover.len(),
                };
                warn!(pool_id = %pool_id, failed_items = outcome.leftover.len(), error = %err, "Result sync incomplete");
                state
                    .carry
                    .entry(pool_id.clone())
                    .or_default()
                    .extend(outcome.leftover);
                report.pools_pending += 1;
            }
        }

        if report.chunks_sent + report.chunks_failed > 0 {
            debug!(
                synced = report.pools_synced,
                pending = report.pools_pending,
                stored = report.items_stored,
                carried = report.items_carried,
                "Sync cycle finished"
            );
        }
        report
    }

    async fn sync_pool(&self, pool_id: &PoolId) -> Result<PoolSync> {
        let collected = match self.source.collect_results(pool_id).await {
            Ok(batch) => batch.results,
            // Pool removed: only carried items remain
            Err(OrchestratorError::PoolNotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };

        let mut items = self.state.lock().carry.remove(pool_id).unwrap_or_default();
        items.extend(collected.into_iter().map(MemoryItem::from));
        if items.is_empty() {
            return Ok(PoolSync::default());
        }

        let mut chunks = Vec::with_capacity(items.len().div_ceil(self.config.batch_size));
        let mut remaining = items.into_iter();
        loop {
            let chunk: Vec<MemoryItem> = remaining.by_ref().take(self.config.batch_size).collect();
            if chunk.is_empty() {
                break;
            }
            chunks.push(chunk);
        }

        let outcomes: Vec<ChunkOutcome> = stream::iter(chunks)
            .map(|chunk| self.send_chunk(pool_id, chunk))
            .buffer_unordered(self.config.max_concurrent_batches)
            .collect()
            .await;

        let mut sync = PoolSync::default();
        for outcome in outcomes {
            sync.items_stored += outcome.stored;
            if outcome.failed {
                sync.chunks_failed += 1;
            } else {
                sync.chunks_sent += 1;
            }
            sync.leftover.extend(outcome.leftover);
        }
        Ok(sync)
    }

    async fn send_chunk(&self, pool_id: &PoolId, chunk: Vec<MemoryItem>) -> ChunkOutcome {
        let size = chunk.len();
        let sent = chunk.clone();
        match self
            .breaker
            .call(|| self.store.batch_store(sent))
            .await
        {
            Ok(receipt) => {
                let acknowledged: HashSet<&str> =
                    receipt.stored_ids.iter().map(String::as_str).collect();
                let leftover: Vec<MemoryItem> = chunk
                    .into_iter()
                    .filter(|item| !acknowledged.contains(item.id.as_str()))
                    .collect();
                let stored = size - leftover.len();
                self.metrics.sync_batch_sent(stored);
                if !leftover.is_empty() {
                    warn!(
                        pool_id = %pool_id,
                        unacknowledged = leftover.len(),
                        "Store did not acknowledge every item"
                    );
                }
                ChunkOutcome {
                    stored,
                    leftover,
                    failed: false,
                }
            }
            Err(e) => {
                self.metrics.sync_batch_failed();
                match e {
                    OrchestratorError::CircuitOpen { .. } => {
                        debug!(pool_id = %pool_id, items = size, "Store circuit open, chunk deferred");
                    }
                    _ => {
                        error!(pool_id = %pool_id, items = size, error = %e, "Store call failed");
                    }
                }
                ChunkOutcome {
                    stored: 0,
                    leftover: chunk,
                    failed: true,
                }
            }
        }
    }

    /// Run the sync loop until the returned handle is shut down
    pub fn spawn(self: &Arc<Self>) -> AggregatorHandle {
        let token = CancellationToken::new();
        let this = Arc::clone(self);
        let cancel = token.clone();
        let join = tokio::spawn(async move { this.run(cancel).await });
        AggregatorHandle {
            aggregator: Arc::clone(self),
            token,
            join,
        }
    }

    async fn run(&self, cancel: CancellationToken) {
        let start = tokio::time::Instant::now() + self.config.interval;
        let mut ticker = tokio::time::interval_at(start, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            event_driven = self.config.event_driven,
            "Result sync loop started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Result sync loop shutting down");
                    break;
                }
                _ = ticker.tick() => {}
                _ = self.wake.notified(), if self.config.event_driven => {}
            }
            self.sync_once().await;
        }
    }
}

#[async_trait]
impl Subscriber for MemoryAggregator {
    async fn handle(&self, message: &BusMessage) -> anyhow::Result<()> {
        if let BusMessage::TaskCompleted { pool_id, .. } = message {
            self.mark_dirty(pool_id.clone());
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "MemoryAggregator"
    }
}

#[async_trait]
impl ResultSink for MemoryAggregator {
    async fn accept(&self, batch: ResultBatch) {
        if batch.is_empty() {
            return;
        }
        let pool_id = batch.pool_id.clone();
        self.state
            .lock()
            .carry
            .entry(pool_id.clone())
            .or_default()
            .extend(batch.results.into_iter().map(MemoryItem::from));
        self.mark_dirty(pool_id);
    }
}

/// Owns the running sync loop
pub struct AggregatorHandle {
    aggregator: Arc<MemoryAggregator>,
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl AggregatorHandle {
    pub fn aggregator(&self) -> &Arc<MemoryAggregator> {
        &self.aggregator
    }

    /// Stop the loop and run a final flush
    pub async fn shutdown(self) -> SyncReport {
        self.token.cancel();
        if let Err(e) = self.join.await {
            error!(error = %e, "Result sync loop panicked");
        }
        let report = self.aggregator.sync_once().await;
        info!(
            stored = report.items_stored,
            carried = report.items_carried,
            "Result sync stopped"
        );
        report
    }
}
