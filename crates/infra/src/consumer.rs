//! Bus consumer: a bounded worker pool that projects deliveries and settles
//! them only after the projection call returned.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use smartproj_core::{FailureKind, TenantId};
use smartproj_events::{BusError, BusMessage, Delivery, MessageBus, Subscription, TopicPattern};

use crate::cancel::Cancellation;
use crate::projection::{ConsumedEventRecord, ProjectionManager, ProjectionOutcome};
use crate::retry::RetryBackoff;
use crate::workers::WorkerHandle;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Consumer group; instances sharing it split the traffic.
    pub group: String,
    /// Topic patterns (`*` one segment, `#` the rest).
    pub topics: Vec<String>,
    pub workers: usize,
    /// Deliveries buffered per worker before the dispatcher waits.
    pub queue_depth: usize,
    /// Wait before handing a transiently failed delivery back to the bus.
    pub retry: RetryBackoff,
    /// Append every delivery to the consumed-event log.
    pub audit: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group: "projections".to_string(),
            topics: vec!["#".to_string()],
            workers: 4,
            queue_depth: 64,
            retry: RetryBackoff::exponential(Duration::from_millis(200), Duration::from_secs(30)),
            audit: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub received: u64,
    pub projected: u64,
    pub stale: u64,
    pub skipped: u64,
    /// Nacked for redelivery after a transient failure.
    pub retried: u64,
    /// Acked after a non-retryable error.
    pub dropped: u64,
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("invalid topic pattern '{0}'")]
    InvalidPattern(String),
    #[error(transparent)]
    Bus(#[from] BusError),
}

impl ConsumerError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ConsumerError::InvalidPattern(_) => FailureKind::Configuration,
            ConsumerError::Bus(e) => e.kind(),
        }
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Nacked,
}

/// Projects bus deliveries.
///
/// - Ack after `Ok` (written, stale or skipped)
/// - Nack after a transient error, following a backoff delay
/// - Ack after any other error; poison messages never loop
pub struct EventConsumer {
    bus: Arc<dyn MessageBus>,
    manager: Arc<ProjectionManager>,
    config: ConsumerConfig,
    stats: Arc<Mutex<ConsumerStats>>,
}

impl core::fmt::Debug for EventConsumer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventConsumer").field("config", &self.config).finish_non_exhaustive()
    }
}

impl EventConsumer {
    pub fn new(bus: Arc<dyn MessageBus>, manager: Arc<ProjectionManager>, config: ConsumerConfig) -> Self {
        Self {
            bus,
            manager,
            config,
            stats: Arc::new(Mutex::new(ConsumerStats::default())),
        }
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn record(&self, f: impl FnOnce(&mut ConsumerStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    fn patterns(&self) -> Result<Vec<TopicPattern>, ConsumerError> {
        self.config
            .topics
            .iter()
            .map(|raw| TopicPattern::new(raw.as_str()).map_err(|_| ConsumerError::InvalidPattern(raw.clone())))
            .collect()
    }

    /// Project one delivery and settle it.
    pub async fn process(&self, delivery: Delivery, cancel: &Cancellation) -> Settlement {
        let message = delivery.message().clone();
        let tenant_id = message.key.parse::<TenantId>().ok();
        self.record(|s| s.received += 1);

        let result = self.manager.handle_event(&message.topic, tenant_id, &message.payload).await;
        let processed = matches!(result, Ok(ref outcome) if !matches!(outcome, ProjectionOutcome::Skipped(_)));
        self.audit(&delivery, processed).await;

        match result {
            Ok(outcome) => {
                self.record(|s| match outcome {
                    ProjectionOutcome::Inserted | ProjectionOutcome::Replaced => s.projected += 1,
                    ProjectionOutcome::Stale => s.stale += 1,
                    ProjectionOutcome::Skipped(_) => s.skipped += 1,
                });
                settle_ack(delivery)
            }
            Err(err) if err.kind().is_retryable() => {
                let attempt = delivery.attempt();
                let delay = self.config.retry.jittered_delay(attempt);
                warn!(
                    topic = %message.topic,
                    key = %message.key,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient projection failure; redelivering"
                );
                // Shutdown cuts the wait short; the nack still happens.
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {}
                }
                self.record(|s| s.retried += 1);
                settle_nack(delivery)
            }
            Err(err) => {
                error!(
                    topic = %message.topic,
                    key = %message.key,
                    kind = ?err.kind(),
                    error = %err,
                    "projection failed permanently; dropping delivery"
                );
                self.record(|s| s.dropped += 1);
                settle_ack(delivery)
            }
        }
    }

    async fn audit(&self, delivery: &Delivery, processed: bool) {
        if !self.config.audit {
            return;
        }
        let message = delivery.message();
        let record = ConsumedEventRecord {
            topic: message.topic.clone(),
            key: (!message.key.is_empty()).then(|| message.key.clone()),
            received_at: delivery.received_at(),
            processed,
        };
        if let Err(err) = self.manager.store().log_consumed(record).await {
            warn!(topic = %message.topic, error = %err, "failed to append consumed-event log");
        }
    }

    /// Subscribe, then run the pool in the background.
    ///
    /// Subscribing happens before this returns, so messages published after
    /// `start` are guaranteed to reach the group.
    pub async fn start(self) -> Result<ConsumerHandle, ConsumerError> {
        let patterns = self.patterns()?;
        let subscription = self.bus.subscribe(&self.config.group, &patterns).await?;
        info!(
            group = %self.config.group,
            topics = ?self.config.topics,
            workers = self.config.workers,
            "event consumer subscribed"
        );

        let this = Arc::new(self);
        let stats = this.stats.clone();
        let worker = WorkerHandle::spawn("event-consumer", move |cancel| this.run(subscription, cancel));
        Ok(ConsumerHandle { worker, stats })
    }

    async fn run(self: Arc<Self>, mut subscription: Subscription, cancel: Cancellation) {
        let workers = self.config.workers.max(1);
        let mut queues: Vec<mpsc::Sender<Delivery>> = Vec::with_capacity(workers);
        let mut joins = Vec::with_capacity(workers);
        for id in 0..workers {
            let (tx, mut rx) = mpsc::channel::<Delivery>(self.config.queue_depth.max(1));
            let this = self.clone();
            let cancel = cancel.clone();
            joins.push(tokio::spawn(async move {
                while let Some(delivery) = rx.recv().await {
                    this.process(delivery, &cancel).await;
                }
                debug!(worker = id, "consumer worker drained");
            }));
            queues.push(tx);
        }

        loop {
            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                delivery = subscription.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };
            let idx = partition(delivery.message(), workers);
            tokio::select! {
                biased;
                // not yet dispatched: dropping it hands it back to the bus
                _ = cancel.cancelled() => break,
                sent = queues[idx].send(delivery) => {
                    if sent.is_err() {
                        error!(worker = idx, "consumer worker queue closed");
                        break;
                    }
                }
            }
        }

        subscription.close();
        drop(subscription);
        drop(queues);
        for join in joins {
            if let Err(err) = join.await {
                error!(error = %err, "consumer worker panicked");
            }
        }
        info!(group = %self.config.group, stats = ?self.stats(), "event consumer stopped");
    }
}

/// Same key, same worker: one tenant's events are processed in order.
fn partition(message: &BusMessage, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    if message.key.is_empty() {
        message.topic.hash(&mut hasher);
    } else {
        message.key.hash(&mut hasher);
    }
    (hasher.finish() % workers as u64) as usize
}

fn settle_ack(delivery: Delivery) -> Settlement {
    let topic = delivery.message().topic.clone();
    if let Err(err) = delivery.ack() {
        warn!(topic = %topic, error = %err, "ack failed; delivery may be redelivered");
    }
    Settlement::Acked
}

fn settle_nack(delivery: Delivery) -> Settlement {
    let topic = delivery.message().topic.clone();
    if let Err(err) = delivery.nack() {
        warn!(topic = %topic, error = %err, "nack failed; transport will redeliver on timeout");
    }
    Settlement::Nacked
}

/// Handle to a running [`EventConsumer`].
#[derive(Debug)]
pub struct ConsumerHandle {
    worker: WorkerHandle,
    stats: Arc<Mutex<ConsumerStats>>,
}

impl ConsumerHandle {
    pub fn stats(&self) -> ConsumerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Stop receiving, let workers finish what they hold, then stop.
    pub async fn shutdown(self) {
        self.worker.shutdown().await;
    }
}
