//! Redis Streams-backed message bus (durable, at-least-once delivery).
//!
//! - **Stream**: every topic goes to one stream (`smartproj:events` by default);
//!   each entry carries `topic`, `key` and `payload` fields
//! - **Consumer groups**: one Redis consumer group per bus group; each
//!   subscription is a named consumer inside it
//! - **Explicit ack**: `XACK` only when the [`Delivery`] is acked
//! - **Redelivery**: nacked entries are re-claimed on the next poll; entries
//!   pending longer than `pending_timeout` (crashed consumers) are `XCLAIM`ed
//! - **Dead-letter stream**: entries delivered more than `max_retries` times are
//!   copied to `smartproj:events:dlq` and acked
//!
//! Entries whose topic matches none of the subscription's patterns are acked
//! without being handed out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamClaimReply, StreamId, StreamMaxlen, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, instrument, warn};

use smartproj_events::{Acknowledge, BusError, BusMessage, Delivery, DeliveryTag, MessageBus, Subscription, TopicPattern};

use crate::retry::duration_ms;

const FIELD_TOPIC: &str = "topic";
const FIELD_KEY: &str = "key";
const FIELD_PAYLOAD: &str = "payload";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisStreamsConfig {
    pub url: String,
    pub stream_key: String,
    pub dlq_key: String,
    /// Deliveries after which an entry is dead-lettered.
    pub max_retries: u32,
    /// Pending entries idle this long are claimed by another consumer.
    #[serde(with = "duration_ms")]
    pub pending_timeout: Duration,
    pub batch_size: usize,
    #[serde(with = "duration_ms")]
    pub block: Duration,
    /// Approximate `MAXLEN` trim applied on publish.
    pub max_len: Option<usize>,
}

impl Default for RedisStreamsConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            stream_key: "smartproj:events".to_string(),
            dlq_key: "smartproj:events:dlq".to_string(),
            max_retries: 5,
            pending_timeout: Duration::from_secs(60),
            batch_size: 32,
            block: Duration::from_millis(500),
            max_len: None,
        }
    }
}

fn unavailable(context: &str, err: redis::RedisError) -> BusError {
    BusError::Unavailable(format!("{context}: {err}"))
}

#[derive(Clone)]
pub struct RedisStreamsBus {
    client: redis::Client,
    config: Arc<RedisStreamsConfig>,
    publisher: Arc<Mutex<Option<MultiplexedConnection>>>,
}

impl core::fmt::Debug for RedisStreamsBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsBus")
            .field("stream_key", &self.config.stream_key)
            .field("dlq_key", &self.config.dlq_key)
            .finish_non_exhaustive()
    }
}

impl RedisStreamsBus {
    /// Opening the client does not connect; the first command does.
    pub fn new(config: RedisStreamsConfig) -> Result<Self, BusError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| BusError::InvalidSubscription(format!("invalid redis url: {e}")))?;
        Ok(Self {
            client,
            config: Arc::new(config),
            publisher: Arc::new(Mutex::new(None)),
        })
    }

    pub fn config(&self) -> &RedisStreamsConfig {
        &self.config
    }

    async fn publish_connection(&self) -> Result<MultiplexedConnection, BusError> {
        let mut slot = self.publisher.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| unavailable("redis connect failed", e))?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Create the consumer group (and the stream) unless it exists.
    pub async fn ensure_group(&self, group: &str) -> Result<(), BusError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| unavailable("redis connect failed", e))?;
        ensure_group(&mut conn, &self.config.stream_key, group).await
    }
}

async fn ensure_group(conn: &mut MultiplexedConnection, stream: &str, group: &str) -> Result<(), BusError> {
    let created: redis::RedisResult<()> = conn.xgroup_create_mkstream(stream, group, "0").await;
    match created {
        Ok(()) => {
            info!(stream, group, "created redis consumer group");
            Ok(())
        }
        Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
        Err(err) => Err(unavailable("XGROUP CREATE failed", err)),
    }
}

#[async_trait]
impl MessageBus for RedisStreamsBus {
    #[instrument(skip(self, message), fields(topic = %message.topic, key = %message.key), err)]
    async fn publish(&self, message: BusMessage) -> Result<(), BusError> {
        let mut conn = self.publish_connection().await?;
        let fields = [
            (FIELD_TOPIC, message.topic.as_str()),
            (FIELD_KEY, message.key.as_str()),
            (FIELD_PAYLOAD, message.payload.as_str()),
        ];
        let added: redis::RedisResult<String> = match self.config.max_len {
            Some(len) => {
                conn.xadd_maxlen(&self.config.stream_key, StreamMaxlen::Approx(len), "*", &fields)
                    .await
            }
            None => conn.xadd(&self.config.stream_key, "*", &fields).await,
        };
        match added {
            Ok(id) => {
                debug!(entry_id = %id, "appended to stream");
                Ok(())
            }
            Err(err) => {
                // reconnect on the next publish
                *self.publisher.lock().await = None;
                Err(unavailable("XADD failed", err))
            }
        }
    }

    async fn subscribe(&self, group: &str, patterns: &[TopicPattern]) -> Result<Subscription, BusError> {
        if group.trim().is_empty() {
            return Err(BusError::InvalidSubscription("consumer group must not be empty".to_string()));
        }
        if patterns.is_empty() {
            return Err(BusError::InvalidSubscription("at least one topic pattern is required".to_string()));
        }

        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| unavailable("redis connect failed", e))?;
        ensure_group(&mut conn, &self.config.stream_key, group).await?;

        let (deliveries, receiver) = mpsc::unbounded_channel();
        let (settle_tx, settle_rx) = mpsc::unbounded_channel();
        let poller = StreamPoller {
            conn,
            config: self.config.clone(),
            group: group.to_string(),
            consumer: format!("{group}-{}", uuid::Uuid::now_v7()),
            patterns: patterns.to_vec(),
            acker: Arc::new(StreamAcker { settle: settle_tx }),
            settle_rx,
            deliveries,
            redeliver: HashMap::new(),
        };
        info!(group, consumer = %poller.consumer, "subscribed to redis stream");
        tokio::spawn(poller.run());
        Ok(Subscription::new(receiver))
    }
}

#[derive(Debug)]
enum Settle {
    Ack(String),
    Nack { id: String, attempt: u32 },
}

/// Forwards settlements to the subscription's poller task.
struct StreamAcker {
    settle: mpsc::UnboundedSender<Settle>,
}

impl Acknowledge for StreamAcker {
    fn ack(&self, tag: &DeliveryTag) -> Result<(), BusError> {
        self.settle.send(Settle::Ack(tag.0.clone())).map_err(|_| BusError::Closed)
    }

    fn nack(&self, tag: &DeliveryTag, _message: &BusMessage, attempt: u32) -> Result<(), BusError> {
        self.settle
            .send(Settle::Nack {
                id: tag.0.clone(),
                attempt,
            })
            .map_err(|_| BusError::Closed)
    }
}

struct StreamPoller {
    conn: MultiplexedConnection,
    config: Arc<RedisStreamsConfig>,
    group: String,
    consumer: String,
    patterns: Vec<TopicPattern>,
    acker: Arc<StreamAcker>,
    settle_rx: mpsc::UnboundedReceiver<Settle>,
    deliveries: mpsc::UnboundedSender<Delivery>,
    /// Nacked entry id -> attempt number of the next delivery.
    redeliver: HashMap<String, u32>,
}

impl StreamPoller {
    async fn run(mut self) {
        loop {
            self.drain_settlements().await;
            if self.deliveries.is_closed() {
                break;
            }

            if let Err(err) = self.poll_once().await {
                error!(group = %self.group, error = %err, "redis stream poll failed");
                tokio::time::sleep(self.config.block).await;
            }
        }
        // pending entries stay in the group's PEL and are claimed by the next consumer
        self.drain_settlements().await;
        info!(group = %self.group, consumer = %self.consumer, "redis stream subscription closed");
    }

    async fn poll_once(&mut self) -> Result<(), BusError> {
        self.redeliver_nacked().await?;
        self.claim_stale().await?;
        self.read_new().await
    }

    async fn drain_settlements(&mut self) {
        let mut acks = Vec::new();
        while let Ok(settle) = self.settle_rx.try_recv() {
            match settle {
                Settle::Ack(id) => acks.push(id),
                Settle::Nack { id, attempt } => {
                    self.redeliver.insert(id, attempt.saturating_add(1));
                }
            }
        }
        if let Err(err) = self.xack(&acks).await {
            warn!(group = %self.group, count = acks.len(), error = %err, "XACK failed; entries will be redelivered");
        }
    }

    async fn xack(&mut self, ids: &[String]) -> Result<(), BusError> {
        if ids.is_empty() {
            return Ok(());
        }
        let _: u64 = self
            .conn
            .xack(&self.config.stream_key, &self.group, ids)
            .await
            .map_err(|e| unavailable("XACK failed", e))?;
        Ok(())
    }

    async fn redeliver_nacked(&mut self) -> Result<(), BusError> {
        if self.redeliver.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = self.redeliver.keys().cloned().collect();
        let claimed: StreamClaimReply = self
            .conn
            .xclaim(&self.config.stream_key, &self.group, &self.consumer, 0, &ids)
            .await
            .map_err(|e| unavailable("XCLAIM failed", e))?;
        for entry in claimed.ids {
            let attempt = self.redeliver.remove(&entry.id).unwrap_or(2);
            self.deliver(entry, attempt).await?;
        }
        // ids that were acked or trimmed meanwhile
        self.redeliver.clear();
        Ok(())
    }

    async fn claim_stale(&mut self) -> Result<(), BusError> {
        let pending: StreamPendingCountReply = self
            .conn
            .xpending_count(&self.config.stream_key, &self.group, "-", "+", self.config.batch_size)
            .await
            .map_err(|e| unavailable("XPENDING failed", e))?;

        let timeout_ms = self.config.pending_timeout.as_millis() as usize;
        let stale: HashMap<String, u32> = pending
            .ids
            .into_iter()
            .filter(|p| p.last_delivered_ms >= timeout_ms)
            .map(|p| (p.id, p.times_delivered as u32))
            .collect();
        if stale.is_empty() {
            return Ok(());
        }

        let ids: Vec<&String> = stale.keys().collect();
        let claimed: StreamClaimReply = self
            .conn
            .xclaim(&self.config.stream_key, &self.group, &self.consumer, timeout_ms, &ids)
            .await
            .map_err(|e| unavailable("XCLAIM failed", e))?;
        for entry in claimed.ids {
            let attempt = stale.get(&entry.id).copied().unwrap_or(1).saturating_add(1);
            warn!(group = %self.group, entry_id = %entry.id, attempt, "claimed stale pending entry");
            self.deliver(entry, attempt).await?;
        }
        Ok(())
    }

    async fn read_new(&mut self) -> Result<(), BusError> {
        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(self.config.batch_size)
            .block(self.config.block.as_millis() as usize);
        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[&self.config.stream_key], &[">"], &options)
            .await
            .map_err(|e| unavailable("XREADGROUP failed", e))?;

        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in key.ids {
                self.deliver(entry, 1).await?;
            }
        }
        Ok(())
    }

    async fn deliver(&mut self, entry: StreamId, attempt: u32) -> Result<(), BusError> {
        let message = match decode_entry(&entry) {
            Ok(message) => message,
            Err(reason) => {
                warn!(group = %self.group, entry_id = %entry.id, %reason, "dead-lettering undecodable entry");
                return self.dead_letter(&entry, attempt, &reason).await;
            }
        };

        if !self.patterns.iter().any(|p| p.matches(&message.topic)) {
            return self.xack(&[entry.id]).await;
        }

        if attempt > self.config.max_retries {
            warn!(
                group = %self.group,
                entry_id = %entry.id,
                topic = %message.topic,
                attempt,
                "retries exhausted; dead-lettering"
            );
            return self.dead_letter(&entry, attempt, "retries exhausted").await;
        }

        let acker: Arc<dyn Acknowledge> = self.acker.clone();
        let delivery = Delivery::new(message, DeliveryTag(entry.id), attempt, acker);
        if self.deliveries.send(delivery).is_err() {
            // the returned delivery is dropped here and nacks itself; the entry stays pending
            debug!(group = %self.group, "subscriber gone");
        }
        Ok(())
    }

    async fn dead_letter(&mut self, entry: &StreamId, attempt: u32, reason: &str) -> Result<(), BusError> {
        let topic: String = entry.get(FIELD_TOPIC).unwrap_or_default();
        let key: String = entry.get(FIELD_KEY).unwrap_or_default();
        let payload: String = entry.get(FIELD_PAYLOAD).unwrap_or_default();
        let attempts = attempt.to_string();
        let failed_at = chrono::Utc::now().to_rfc3339();
        let fields = [
            ("original_id", entry.id.as_str()),
            ("group", self.group.as_str()),
            ("attempts", attempts.as_str()),
            ("reason", reason),
            ("failed_at", failed_at.as_str()),
            (FIELD_TOPIC, topic.as_str()),
            (FIELD_KEY, key.as_str()),
            (FIELD_PAYLOAD, payload.as_str()),
        ];
        let _: String = self
            .conn
            .xadd(&self.config.dlq_key, "*", &fields)
            .await
            .map_err(|e| unavailable("dead-letter XADD failed", e))?;
        self.xack(&[entry.id.clone()]).await
    }
}

fn decode_entry(entry: &StreamId) -> Result<BusMessage, String> {
    let topic: String = entry.get(FIELD_TOPIC).ok_or_else(|| "missing topic field".to_string())?;
    let payload: String = entry.get(FIELD_PAYLOAD).ok_or_else(|| "missing payload field".to_string())?;
    let key: String = entry.get(FIELD_KEY).unwrap_or_default();
    Ok(BusMessage::new(topic, key, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(fields: &[(&str, &str)]) -> StreamId {
        StreamId {
            id: "1700000000000-0".to_string(),
            map: fields
                .iter()
                .map(|(k, v)| (k.to_string(), redis::Value::Data(v.as_bytes().to_vec())))
                .collect(),
        }
    }

    #[test]
    fn decodes_stream_fields_into_message() {
        let message = decode_entry(&entry(&[
            (FIELD_TOPIC, "domain.sales.changed"),
            (FIELD_KEY, "tenant-1"),
            (FIELD_PAYLOAD, "{}"),
        ]))
        .unwrap();
        assert_eq!(message, BusMessage::new("domain.sales.changed", "tenant-1", "{}"));
    }

    #[test]
    fn key_is_optional_but_topic_and_payload_are_not() {
        let message = decode_entry(&entry(&[(FIELD_TOPIC, "a.b"), (FIELD_PAYLOAD, "{}")])).unwrap();
        assert_eq!(message.key, "");

        assert!(decode_entry(&entry(&[(FIELD_PAYLOAD, "{}")])).is_err());
        assert!(decode_entry(&entry(&[(FIELD_TOPIC, "a.b")])).is_err());
    }

    #[test]
    fn invalid_url_is_rejected_without_connecting() {
        let config = RedisStreamsConfig {
            url: "not a url".to_string(),
            ..RedisStreamsConfig::default()
        };
        let err = RedisStreamsBus::new(config).unwrap_err();
        assert!(matches!(err, BusError::InvalidSubscription(_)));
    }

    #[test]
    fn config_reads_durations_as_milliseconds() {
        let config: RedisStreamsConfig =
            serde_json::from_value(serde_json::json!({"pending_timeout": 1500, "max_retries": 3})).unwrap();
        assert_eq!(config.pending_timeout, Duration::from_millis(1500));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.stream_key, "smartproj:events");
    }
}
