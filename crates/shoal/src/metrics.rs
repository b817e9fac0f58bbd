//! Counters exposed to an external metrics collector
//!
//! Components share one [`OrchestratorMetrics`] behind an `Arc` and bump
//! relaxed atomics; a collector reads a [`MetricsSnapshot`]. Export format and
//! transport are up to the collector.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Live counters
#[derive(Debug, Default)]
pub struct OrchestratorMetrics {
    tasks_routed: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_timed_out: AtomicU64,
    circuit_open_events: AtomicU64,
    index_rebuilds: AtomicU64,
    workers_respawned: AtomicU64,
    subscriber_failures: AtomicU64,
    subscriber_timeouts: AtomicU64,
    sync_batches_sent: AtomicU64,
    sync_batches_failed: AtomicU64,
    sync_items_stored: AtomicU64,
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub tasks_routed: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_timed_out: u64,
    pub circuit_open_events: u64,
    pub index_rebuilds: u64,
    pub workers_respawned: u64,
    pub subscriber_failures: u64,
    pub subscriber_timeouts: u64,
    pub sync_batches_sent: u64,
    pub sync_batches_failed: u64,
    pub sync_items_stored: u64,
}

impl OrchestratorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_routed(&self) {
        self.tasks_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// A timeout is also a failure; both counters move
    pub fn task_timed_out(&self) {
        self.tasks_timed_out.fetch_add(1, Ordering::Relaxed);
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn circuit_opened(&self) {
        self.circuit_open_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn index_rebuilt(&self) {
        self.index_rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_respawned(&self) {
        self.workers_respawned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscriber_failed(&self) {
        self.subscriber_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscriber_timed_out(&self) {
        self.subscriber_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sync_batch_sent(&self, items_stored: usize) {
        self.sync_batches_sent.fetch_add(1, Ordering::Relaxed);
        self.sync_items_stored
            .fetch_add(items_stored as u64, Ordering::Relaxed);
    }

    pub fn sync_batch_failed(&self) {
        self.sync_batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_routed: self.tasks_routed.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_timed_out: self.tasks_timed_out.load(Ordering::Relaxed),
            circuit_open_events: self.circuit_open_events.load(Ordering::Relaxed),
            index_rebuilds: self.index_rebuilds.load(Ordering::Relaxed),
            workers_respawned: self.workers_respawned.load(Ordering::Relaxed),
            subscriber_failures: self.subscriber_failures.load(Ordering::Relaxed),
            subscriber_timeouts: self.subscriber_timeouts.load(Ordering::Relaxed),
            sync_batches_sent: self.sync_batches_sent.load(Ordering::Relaxed),
            sync_batches_failed: self.sync_batches_failed.load(Ordering::Relaxed),
            sync_items_stored: self.sync_items_stored.load(Ordering::Relaxed),
        }
    }
}
