// Message Bus
//
// Topic-based publish/subscribe between components. Delivery fans out
// concurrently, bounded by one bus-wide semaphore, and every subscriber call
// is time-bounded. A failing or slow subscriber never affects the others.

mod message;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{OrchestratorError, Result};
use crate::metrics::OrchestratorMetrics;

pub use message::{BusMessage, POOL_LIFECYCLE_CHANGED, TASK_COMPLETED, TASK_FAILED};

// ============================================================================
// Configuration
// ============================================================================

/// Message bus configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageBusConfig {
    /// Maximum subscriber invocations in flight across the whole bus
    pub max_concurrent_subscribers: usize,

    /// Upper bound on a single subscriber invocation
    #[serde(with = "crate::config::duration_millis")]
    pub subscriber_timeout: Duration,
}

impl Default for MessageBusConfig {
    fn default() -> Self {
        Self {
            max_concurrent_subscribers: 100,
            subscriber_timeout: Duration::from_secs(30),
        }
    }
}

impl MessageBusConfig {
    pub fn with_max_concurrent_subscribers(mut self, max: usize) -> Self {
        self.max_concurrent_subscribers = max;
        self
    }

    pub fn with_subscriber_timeout(mut self, timeout: Duration) -> Self {
        self.subscriber_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_subscribers == 0 {
            return Err(OrchestratorError::Config(
                "bus max_concurrent_subscribers must be at least 1".into(),
            ));
        }
        if self.subscriber_timeout.is_zero() {
            return Err(OrchestratorError::Config(
                "bus subscriber_timeout must be positive".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Subscriber Trait
// ============================================================================

/// Handler for bus messages.
///
/// Handlers run concurrently with each other and must tolerate duplicate
/// or out-of-order delivery. Returned errors are logged and counted; they
/// never reach the publisher.
///
/// # Example
///
/// ```ignore
/// struct CompletionCounter(AtomicUsize);
///
/// #[async_trait]
/// impl Subscriber for CompletionCounter {
///     async fn handle(&self, _message: &BusMessage) -> anyhow::Result<()> {
///         self.0.fetch_add(1, Ordering::Relaxed);
///         Ok(())
///     }
/// }
///
/// bus.subscribe(TASK_COMPLETED, Arc::new(CompletionCounter::default()));
/// ```
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn handle(&self, message: &BusMessage) -> anyhow::Result<()>;

    /// Human-readable name for logging/debugging.
    fn name(&self) -> &'static str {
        "Subscriber"
    }
}

/// Handle returned by [`MessageBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    subscriber: Arc<dyn Subscriber>,
}

/// Outcome counts of one publish
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReport {
    pub delivered: usize,
    pub failed: usize,
    pub timed_out: usize,
}

impl PublishReport {
    pub fn total(&self) -> usize {
        self.delivered + self.failed + self.timed_out
    }
}

enum Delivery {
    Delivered,
    Failed,
    TimedOut,
}

// ============================================================================
// MessageBus
// ============================================================================

/// Topic-based publish/subscribe with bounded concurrent delivery
pub struct MessageBus {
    config: MessageBusConfig,
    subscriptions: RwLock<HashMap<String, Vec<Subscription>>>,
    limiter: Arc<Semaphore>,
    next_id: AtomicU64,
    metrics: Arc<OrchestratorMetrics>,
}

impl MessageBus {
    pub fn new(config: MessageBusConfig, metrics: Arc<OrchestratorMetrics>) -> Self {
        let limiter = Arc::new(Semaphore::new(config.max_concurrent_subscribers.max(1)));
        Self {
            config,
            subscriptions: RwLock::new(HashMap::new()),
            limiter,
            next_id: AtomicU64::new(1),
            metrics,
        }
    }

    pub fn config(&self) -> &MessageBusConfig {
        &self.config
    }

    /// Register `subscriber` for `topic`
    pub fn subscribe(&self, topic: &str, subscriber: Arc<dyn Subscriber>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(topic, subscriber = subscriber.name(), "Subscribed");
        self.subscriptions
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(Subscription { id, subscriber });
        id
    }

    /// Remove a subscription. Returns false if it was not registered.
    ///
    /// Deliveries already snapshotted by a running publish still complete.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write();
        for subs in subscriptions.values_mut() {
            if let Some(pos) = subs.iter().position(|s| s.id == id) {
                subs.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscriptions.read().get(topic).map_or(0, Vec::len)
    }

    /// Publish the message on its own topic
    pub async fn emit(&self, message: BusMessage) -> PublishReport {
        self.publish(message.topic(), &message).await
    }

    /// Deliver `message` to every subscriber of `topic`.
    ///
    /// Never fails: subscriber errors and timeouts are logged, counted and
    /// reported.
    pub async fn publish(&self, topic: &str, message: &BusMessage) -> PublishReport {
        let subscribers: Vec<Arc<dyn Subscriber>> = {
            let subscriptions = self.subscriptions.read();
            match subscriptions.get(topic) {
                Some(subs) => subs.iter().map(|s| Arc::clone(&s.subscriber)).collect(),
                None => return PublishReport::default(),
            }
        };

        let timeout = self.config.subscriber_timeout;
        let mut deliveries: FuturesUnordered<_> = subscribers
            .into_iter()
            .map(|subscriber| {
                let limiter = Arc::clone(&self.limiter);
                async move {
                    let Ok(_permit) = limiter.acquire_owned().await else {
                        return Delivery::Failed;
                    };
                    match tokio::time::timeout(timeout, subscriber.handle(message)).await {
                        Ok(Ok(())) => Delivery::Delivered,
                        Ok(Err(e)) => {
                            warn!(
                                topic,
                                subscriber = subscriber.name(),
                                error = %e,
                                "Subscriber failed"
                            );
                            Delivery::Failed
                        }
                        Err(_) => {
                            warn!(
                                topic,
                                subscriber = subscriber.name(),
                                timeout_ms = timeout.as_millis() as u64,
                                "Subscriber timed out"
                            );
                            Delivery::TimedOut
                        }
                    }
                }
            })
            .collect();

        let mut report = PublishReport::default();
        while let Some(delivery) = deliveries.next().await {
            match delivery {
                Delivery::Delivered => report.delivered += 1,
                Delivery::Failed => {
                    self.metrics.subscriber_failed();
                    report.failed += 1;
                }
                Delivery::TimedOut => {
                    self.metrics.subscriber_timed_out();
                    report.timed_out += 1;
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PoolId, TaskId};
    use std::sync::atomic::AtomicUsize;

    fn completed() -> BusMessage {
        BusMessage::TaskCompleted {
            pool_id: PoolId::from("a"),
            task_id: TaskId::new(),
            result_ref: "a/1".into(),
        }
    }

    fn bus(max: usize, timeout: Duration) -> MessageBus {
        MessageBus::new(
            MessageBusConfig::default()
                .with_max_concurrent_subscribers(max)
                .with_subscriber_timeout(timeout),
            Arc::new(OrchestratorMetrics::new()),
        )
    }

    struct Gauge {
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Subscriber for Gauge {
        async fn handle(&self, _message: &BusMessage) -> anyhow::Result<()> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Subscriber for Failing {
        async fn handle(&self, _message: &BusMessage) -> anyhow::Result<()> {
            anyhow::bail!("handler exploded")
        }

        fn name(&self) -> &'static str {
            "Failing"
        }
    }

    struct Stuck;

    #[async_trait]
    impl Subscriber for Stuck {
        async fn handle(&self, _message: &BusMessage) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    struct Counter(AtomicUsize);

    #[async_trait]
    impl Subscriber for Counter {
        async fn handle(&self, _message: &BusMessage) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_never_exceeds_limit() {
        let bus = bus(4, Duration::from_secs(5));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..25 {
            bus.subscribe(
                TASK_COMPLETED,
                Arc::new(Gauge {
                    current: Arc::clone(&current),
                    peak: Arc::clone(&peak),
                }),
            );
        }

        let report = bus.emit(completed()).await;

        assert_eq!(report.delivered, 25);
        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert_eq!(current.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_is_bus_wide_across_concurrent_publishes() {
        let bus = Arc::new(bus(3, Duration::from_secs(5)));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            bus.subscribe(
                TASK_COMPLETED,
                Arc::new(Gauge {
                    current: Arc::clone(&current),
                    peak: Arc::clone(&peak),
                }),
            );
        }

        let (a, b) = tokio::join!(bus.emit(completed()), bus.emit(completed()));

        assert_eq!(a.delivered + b.delivered, 10);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_and_timeouts_are_isolated() {
        let metrics = Arc::new(OrchestratorMetrics::new());
        let bus = MessageBus::new(
            MessageBusConfig::default().with_subscriber_timeout(Duration::from_secs(1)),
            Arc::clone(&metrics),
        );
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        bus.subscribe(TASK_COMPLETED, Arc::new(Failing));
        bus.subscribe(TASK_COMPLETED, Arc::new(Stuck));
        bus.subscribe(TASK_COMPLETED, counter.clone());

        let report = bus.emit(completed()).await;

        assert_eq!(
            report,
            PublishReport {
                delivered: 1,
                failed: 1,
                timed_out: 1
            }
        );
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        let snap = metrics.snapshot();
        assert_eq!(snap.subscriber_failures, 1);
        assert_eq!(snap.subscriber_timeouts, 1);
    }

    #[tokio::test]
    async fn test_topics_are_isolated_and_unsubscribe_works() {
        let bus = bus(10, Duration::from_secs(1));
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let id = bus.subscribe(TASK_FAILED, counter.clone());

        assert_eq!(bus.emit(completed()).await.total(), 0);
        assert_eq!(bus.subscriber_count(TASK_FAILED), 1);

        let failed = BusMessage::TaskFailed {
            pool_id: PoolId::from("a"),
            task_id: TaskId::new(),
            error: "x".into(),
            error_kind: "io".into(),
        };
        assert_eq!(bus.emit(failed.clone()).await.delivered, 1);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.emit(failed).await.total(), 0);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_config_validation() {
        assert!(MessageBusConfig::default().validate().is_ok());
        assert!(MessageBusConfig::default()
            .with_max_concurrent_subscribers(0)
            .validate()
            .is_err());
    }
}
