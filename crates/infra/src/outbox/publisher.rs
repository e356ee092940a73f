//! Background publisher: claims pending outbox rows and hands them to the bus.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use smartproj_events::{BusMessage, MessageBus};

use super::store::OutboxStore;
use super::types::{OutboxError, OutboxMessage};
use crate::cancel::Cancellation;
use crate::retry::{RetryBackoff, duration_ms};
use crate::workers::WorkerHandle;

/// Publisher configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Lease owner recorded on claimed rows.
    pub name: String,
    /// How often to poll for pending rows when the last batch was not full
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// A lease older than this is considered abandoned
    #[serde(with = "duration_ms")]
    pub claim_timeout: Duration,
    /// How often the Failed -> Pending sweep runs
    #[serde(with = "duration_ms")]
    pub sweep_interval: Duration,
    pub sweep_limit: usize,
    pub retry: RetryBackoff,
    /// Published rows are kept this long before purging
    #[serde(with = "duration_ms")]
    pub retention: Duration,
    #[serde(with = "duration_ms")]
    pub cleanup_interval: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            name: "outbox-publisher".to_string(),
            poll_interval: Duration::from_millis(100),
            batch_size: 100,
            claim_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(5),
            sweep_limit: 500,
            retry: RetryBackoff::default(),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Running totals since the publisher started.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublisherStats {
    pub batches: u64,
    pub claimed: u64,
    pub published: u64,
    pub failed: u64,
    pub requeued: u64,
    pub purged: u64,
}

/// Outcome of one claimed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub published: usize,
    pub failed: usize,
}

/// Moves outbox rows onto the message bus.
///
/// - Claims in `CreatedAt` order under a lease, so concurrent publishers never
///   hand the same row to the bus for the same lease
/// - A bus failure marks the row `Failed`; the sweep brings it back later
/// - A row is only marked `Published` after the bus accepted it
pub struct OutboxPublisher {
    store: Arc<dyn OutboxStore>,
    bus: Arc<dyn MessageBus>,
    config: PublisherConfig,
    stats: Arc<Mutex<PublisherStats>>,
}

impl OutboxPublisher {
    pub fn new(store: Arc<dyn OutboxStore>, bus: Arc<dyn MessageBus>, config: PublisherConfig) -> Self {
        Self {
            store,
            bus,
            config,
            stats: Arc::new(Mutex::new(PublisherStats::default())),
        }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    pub fn stats(&self) -> PublisherStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn record(&self, f: impl FnOnce(&mut PublisherStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    /// Claim one batch and publish every row in it. The batch always runs to
    /// completion once claimed.
    pub async fn publish_batch(&self) -> Result<BatchReport, OutboxError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.claim_timeout).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let batch = self
            .store
            .claim_pending(self.config.batch_size, cutoff, &self.config.name)
            .await?;

        let mut report = BatchReport {
            claimed: batch.len(),
            ..BatchReport::default()
        };
        if batch.is_empty() {
            return Ok(report);
        }

        for message in batch {
            if self.publish_one(&message).await {
                report.published += 1;
            } else {
                report.failed += 1;
            }
        }

        self.record(|s| {
            s.batches += 1;
            s.claimed += report.claimed as u64;
            s.published += report.published as u64;
            s.failed += report.failed as u64;
        });
        debug!(
            publisher = %self.config.name,
            claimed = report.claimed,
            published = report.published,
            failed = report.failed,
            "outbox batch processed"
        );
        Ok(report)
    }

    async fn publish_one(&self, message: &OutboxMessage) -> bool {
        let bus_message = BusMessage::new(
            message.topic.as_str(),
            message.tenant_id.to_string(),
            message.payload.clone(),
        );

        match self.bus.publish(bus_message).await {
            Ok(()) => {
                if let Err(err) = self.store.mark_published(message.id).await {
                    // Lease expiry will hand the row out again; the consumer tolerates the duplicate.
                    error!(
                        outbox_id = %message.id,
                        tenant_id = %message.tenant_id,
                        topic = %message.topic,
                        error = %err,
                        "published to bus but failed to mark outbox row"
                    );
                }
                true
            }
            Err(bus_err) => {
                warn!(
                    outbox_id = %message.id,
                    tenant_id = %message.tenant_id,
                    topic = %message.topic,
                    error = %bus_err,
                    "bus publish failed; marking outbox row failed"
                );
                if let Err(err) = self.store.mark_failed(message.id, &bus_err.to_string()).await {
                    error!(outbox_id = %message.id, error = %err, "failed to mark outbox row failed");
                }
                false
            }
        }
    }

    /// Failed -> Pending for rows whose backoff elapsed.
    pub async fn sweep(&self) -> Result<usize, OutboxError> {
        let requeued = self
            .store
            .requeue_failed(Utc::now(), &self.config.retry, self.config.sweep_limit)
            .await?;
        if requeued > 0 {
            info!(publisher = %self.config.name, requeued, "requeued failed outbox rows");
            self.record(|s| s.requeued += requeued as u64);
        }
        Ok(requeued)
    }

    /// Delete published rows older than the retention window.
    pub async fn purge(&self) -> Result<usize, OutboxError> {
        let retention = chrono::Duration::from_std(self.config.retention).unwrap_or_else(|_| chrono::Duration::days(7));
        let purged = self.store.purge_published(Utc::now() - retention).await?;
        if purged > 0 {
            info!(publisher = %self.config.name, purged, "purged published outbox rows");
            self.record(|s| s.purged += purged as u64);
        }
        Ok(purged)
    }

    /// Run until `cancel` fires. Cancellation is only observed between
    /// batches, so a claimed batch is always finished.
    pub async fn run(self, cancel: Cancellation) {
        info!(publisher = %self.config.name, batch_size = self.config.batch_size, "outbox publisher started");

        let mut tick = tokio::time::interval(self.config.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_sweep: Option<Instant> = None;
        let mut last_purge = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }

            if last_sweep.is_none_or(|at| at.elapsed() >= self.config.sweep_interval) {
                if let Err(err) = self.sweep().await {
                    warn!(publisher = %self.config.name, error = %err, "outbox retry sweep failed");
                }
                last_sweep = Some(Instant::now());
            }

            if last_purge.elapsed() >= self.config.cleanup_interval {
                if let Err(err) = self.purge().await {
                    warn!(publisher = %self.config.name, error = %err, "outbox purge failed");
                }
                last_purge = Instant::now();
            }

            match self.publish_batch().await {
                // More may be waiting; skip the poll delay.
                Ok(report) if report.claimed >= self.config.batch_size => tick.reset_immediately(),
                Ok(_) => {}
                Err(err) => warn!(publisher = %self.config.name, error = %err, "outbox claim failed"),
            }
        }

        info!(publisher = %self.config.name, stats = ?self.stats(), "outbox publisher stopped");
    }

    /// Spawn on the current runtime.
    pub fn spawn(self) -> PublisherHandle {
        let stats = self.stats.clone();
        let worker = WorkerHandle::spawn("outbox-publisher", move |cancel| self.run(cancel));
        PublisherHandle { worker, stats }
    }
}

/// Handle to a running [`OutboxPublisher`].
#[derive(Debug)]
pub struct PublisherHandle {
    worker: WorkerHandle,
    stats: Arc<Mutex<PublisherStats>>,
}

impl PublisherHandle {
    pub fn stats(&self) -> PublisherStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Finish the current batch, then stop.
    pub async fn shutdown(self) {
        self.worker.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use smartproj_core::TenantId;
    use smartproj_events::{InMemoryMessageBus, Topic, TopicPattern};

    use super::*;
    use crate::outbox::{InMemoryOutboxStore, OutboxStatus, OutboxWriter};

    async fn seeded(store: &InMemoryOutboxStore, topic: &str, n: usize) -> Vec<OutboxMessage> {
        let mut tx = store.begin();
        let mut out = Vec::new();
        for _ in 0..n {
            let msg = OutboxMessage::new(TenantId::new(), Topic::new(topic).unwrap(), "{}");
            out.push(msg.clone());
            tx.enqueue(msg).await.unwrap();
        }
        tx.commit().unwrap();
        out
    }

    fn publisher(store: Arc<InMemoryOutboxStore>, bus: Arc<InMemoryMessageBus>) -> OutboxPublisher {
        OutboxPublisher::new(store, bus, PublisherConfig::default())
    }

    #[tokio::test]
    async fn publishes_and_marks_rows() {
        let store = InMemoryOutboxStore::arc();
        let bus = Arc::new(InMemoryMessageBus::new());
        let msgs = seeded(&store, "domain.sales.changed", 3).await;

        let report = publisher(store.clone(), bus.clone()).publish_batch().await.unwrap();
        assert_eq!(report, BatchReport { claimed: 3, published: 3, failed: 0 });

        for m in &msgs {
            let stored = store.get(m.id).await.unwrap().unwrap();
            assert_eq!(stored.status, OutboxStatus::Published);
            assert!(stored.processed_at.is_some());
        }
        let published = bus.published();
        assert_eq!(published.len(), 3);
        assert_eq!(published[0].key, msgs[0].tenant_id.to_string());
        assert!(store.pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn bus_outage_marks_failed_and_sweep_recovers() {
        let store = InMemoryOutboxStore::arc();
        let bus = Arc::new(InMemoryMessageBus::new());
        let msgs = seeded(&store, "domain.sales.changed", 1).await;
        let mut config = PublisherConfig::default();
        config.retry = RetryBackoff::fixed(Duration::ZERO);
        let publisher = OutboxPublisher::new(store.clone(), bus.clone(), config);

        bus.set_unavailable(true);
        let report = publisher.publish_batch().await.unwrap();
        assert_eq!(report.failed, 1);
        let failed = store.get(msgs[0].id).await.unwrap().unwrap();
        assert_eq!(failed.status, OutboxStatus::Failed);
        assert!(failed.error.is_some());

        bus.set_unavailable(false);
        assert_eq!(publisher.sweep().await.unwrap(), 1);
        let report = publisher.publish_batch().await.unwrap();
        assert_eq!(report.published, 1);
        assert_eq!(store.get(msgs[0].id).await.unwrap().unwrap().status, OutboxStatus::Published);

        let stats = publisher.stats();
        assert_eq!((stats.failed, stats.requeued, stats.published), (1, 1, 1));
    }

    #[tokio::test]
    async fn concurrent_publishers_never_share_a_row() {
        let store = InMemoryOutboxStore::arc();
        let bus = Arc::new(InMemoryMessageBus::new());
        seeded(&store, "a.b", 50).await;

        let mut cfg_a = PublisherConfig::default();
        cfg_a.name = "a".into();
        cfg_a.batch_size = 7;
        let mut cfg_b = cfg_a.clone();
        cfg_b.name = "b".into();
        let a = OutboxPublisher::new(store.clone(), bus.clone(), cfg_a);
        let b = OutboxPublisher::new(store.clone(), bus.clone(), cfg_b);

        loop {
            let (ra, rb) = tokio::join!(a.publish_batch(), b.publish_batch());
            if ra.unwrap().claimed + rb.unwrap().claimed == 0 {
                break;
            }
        }

        assert_eq!(bus.published().len(), 50);
        assert_eq!(store.stats().await.unwrap().published, 50);
    }

    #[tokio::test]
    async fn run_loop_drains_and_stops_on_shutdown() {
        let store = InMemoryOutboxStore::arc();
        let bus = Arc::new(InMemoryMessageBus::new());
        let mut sub = bus.subscribe("test", &[TopicPattern::all()]).await.unwrap();
        seeded(&store, "domain.sales.changed", 5).await;

        let mut config = PublisherConfig::default();
        config.poll_interval = Duration::from_millis(5);
        config.batch_size = 2;
        let handle = OutboxPublisher::new(store.clone(), bus.clone(), config).spawn();

        for _ in 0..5 {
            let delivery = tokio::time::timeout(Duration::from_secs(2), sub.recv())
                .await
                .expect("delivery in time")
                .expect("bus open");
            delivery.ack().unwrap();
        }

        handle.shutdown().await;
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.published, 5);
        assert_eq!(stats.pending, 0);
    }
}
