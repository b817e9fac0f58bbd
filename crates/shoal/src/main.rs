// shoal-node: runs delegated pools and syncs results to the memory store
//
// Tasks are read from stdin as newline-delimited JSON:
//   {"payload": {...}, "affinity": "pool-0", "priority": 1, "timeout_ms": 5000}
// Only `payload` is required.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use shoal::telemetry::{init_telemetry, TelemetryConfig};
use shoal::{
    DelegatedConfig, HttpMemoryStore, InMemoryMemoryStore, MemoryAggregator, MemoryStore,
    MessageBus, OrchestratorConfig, OrchestratorMetrics, PoolId, PoolManager, PoolSpec,
    ResultSink, Task, TASK_COMPLETED,
};
use tokio::io::{AsyncBufReadExt, BufReader};

/// One line of stdin
#[derive(Debug, Deserialize)]
struct TaskInput {
    payload: serde_json::Value,
    #[serde(default)]
    affinity: Option<PoolId>,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

impl TaskInput {
    fn into_task(self) -> Task {
        let mut task = Task::new(self.payload).with_priority(self.priority);
        task.affinity = self.affinity;
        if let Some(ms) = self.timeout_ms {
            task = task.with_timeout(std::time::Duration::from_millis(ms));
        }
        task
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "info")
    // - LOG_FORMAT: "json" for structured logs
    init_telemetry(TelemetryConfig::from_env())?;

    let config = OrchestratorConfig::from_env();
    config.validate().context("Invalid configuration")?;

    let command = std::env::var("SHOAL_DELEGATE_COMMAND")
        .context("SHOAL_DELEGATE_COMMAND must be set")?;
    let delegate = DelegatedConfig::from_command_line(&command)
        .context("SHOAL_DELEGATE_COMMAND is empty")?;
    let pool_prefix = std::env::var("SHOAL_POOL_ID").unwrap_or_else(|_| "pool".to_string());
    let pool_size: usize = env_or("SHOAL_POOL_SIZE", 4)?;
    let pool_count: usize = env_or("SHOAL_POOL_COUNT", 1)?;

    tracing::info!(
        routing = %config.routing,
        pools = pool_count,
        pool_size,
        program = %delegate.program,
        "shoal-node starting..."
    );

    let metrics = Arc::new(OrchestratorMetrics::new());
    let bus = Arc::new(MessageBus::new(config.bus.clone(), Arc::clone(&metrics)));
    let manager = Arc::new(PoolManager::new(
        config.clone(),
        Arc::clone(&bus),
        Arc::clone(&metrics),
    ));

    for n in 0..pool_count {
        let pool_id = format!("{pool_prefix}-{n}");
        manager
            .spawn_pool(PoolSpec::delegated(pool_id.as_str(), pool_size, delegate.clone()))
            .await
            .with_context(|| format!("Failed to start pool {pool_id}"))?;
    }

    let store: Arc<dyn MemoryStore> = match HttpMemoryStore::from_env()? {
        Some(store) => {
            tracing::info!(url = %store.base_url(), "Syncing results to HTTP memory store");
            Arc::new(store)
        }
        None => {
            tracing::warn!("SHOAL_MEMORY_STORE_URL not set, keeping results in memory");
            Arc::new(InMemoryMemoryStore::new())
        }
    };

    let aggregator = Arc::new(MemoryAggregator::new(
        config.aggregator.clone(),
        manager.clone(),
        store,
        Arc::clone(&metrics),
    ));
    bus.subscribe(TASK_COMPLETED, aggregator.clone());
    let sink: Arc<dyn ResultSink> = aggregator.clone();
    manager.set_result_sink(&sink);
    let sync = aggregator.spawn();

    tokio::select! {
        result = read_tasks(&manager) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Task input failed");
            } else {
                tracing::info!("Input closed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    manager.shutdown().await;
    let report = sync.shutdown().await;
    if report.items_carried > 0 {
        tracing::warn!(items = report.items_carried, "Results left unsynced at shutdown");
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        routed = snapshot.tasks_routed,
        completed = snapshot.tasks_completed,
        failed = snapshot.tasks_failed,
        synced = snapshot.sync_items_stored,
        "Node shutdown complete"
    );
    Ok(())
}

async fn read_tasks(manager: &Arc<PoolManager>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let input: TaskInput = match serde_json::from_str(line) {
            Ok(input) => input,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed task line");
                continue;
            }
        };
        match manager.submit(input.into_task()) {
            Ok(task_id) => tracing::debug!(task_id = %task_id, "Task accepted"),
            Err(e) => tracing::warn!(error = %e, kind = e.kind(), "Task rejected"),
        }
    }
    Ok(())
}

fn env_or(key: &str, default: usize) -> Result<usize> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a positive integer")),
        Err(_) => Ok(default),
    }
}
