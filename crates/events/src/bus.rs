//! Message publishing/consumption abstraction (mechanics only).
//!
//! ## Design Philosophy
//!
//! The bus is intentionally **lightweight** and makes minimal assumptions:
//!
//! - **Opaque topics**: named channels, no schema knowledge
//! - **At-least-once delivery**: a message may be delivered more than once
//! - **No ordering guarantees** across partitions/tenants
//! - **Explicit acknowledgment**: a [`Delivery`] is only settled by [`Delivery::ack`];
//!   a nacked or dropped-unsettled delivery is handed back to the bus for redelivery
//!
//! Consumers must be idempotent; the projection pipeline achieves that with
//! its version guard rather than with bus-level deduplication.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

use smartproj_core::FailureKind;

use crate::topic::TopicPattern;

/// A message as it travels over the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    /// Partition key. The outbox publisher uses the tenant id.
    pub key: String,
    /// Serialized event envelope.
    pub payload: String,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, key: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("bus unavailable: {0}")]
    Unavailable(String),
    #[error("bus closed")]
    Closed,
    #[error("invalid subscription: {0}")]
    InvalidSubscription(String),
}

impl BusError {
    pub fn kind(&self) -> FailureKind {
        match self {
            BusError::InvalidSubscription(_) => FailureKind::Configuration,
            BusError::Unavailable(_) | BusError::Closed => FailureKind::Transient,
        }
    }
}

/// Transport-specific delivery identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub String);

/// Settles deliveries with the transport that produced them.
pub trait Acknowledge: Send + Sync {
    /// The message was processed durably; it must not be redelivered.
    fn ack(&self, tag: &DeliveryTag) -> Result<(), BusError>;

    /// The message was not processed; hand it back for redelivery.
    fn nack(&self, tag: &DeliveryTag, message: &BusMessage, attempt: u32) -> Result<(), BusError>;
}

/// A received message awaiting settlement.
///
/// Dropping an unsettled delivery behaves like [`Delivery::nack`], so a
/// worker that dies mid-flight never loses a message.
pub struct Delivery {
    message: BusMessage,
    tag: DeliveryTag,
    attempt: u32,
    received_at: DateTime<Utc>,
    acker: Arc<dyn Acknowledge>,
    settled: bool,
}

impl core::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("tag", &self.tag)
            .field("attempt", &self.attempt)
            .field("received_at", &self.received_at)
            .finish_non_exhaustive()
    }
}

impl Delivery {
    pub fn new(message: BusMessage, tag: DeliveryTag, attempt: u32, acker: Arc<dyn Acknowledge>) -> Self {
        Self {
            message,
            tag,
            attempt,
            received_at: Utc::now(),
            acker,
            settled: false,
        }
    }

    pub fn message(&self) -> &BusMessage {
        &self.message
    }

    pub fn tag(&self) -> &DeliveryTag {
        &self.tag
    }

    /// 1 for the first delivery, incremented on every redelivery.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn ack(mut self) -> Result<(), BusError> {
        self.settled = true;
        self.acker.ack(&self.tag)
    }

    pub fn nack(mut self) -> Result<(), BusError> {
        self.settled = true;
        self.acker.nack(&self.tag, &self.message, self.attempt)
    }

    /// Settle without notifying the transport. Used by transports that take
    /// an undeliverable message back themselves.
    pub(crate) fn disarm(mut self) -> (BusMessage, u32) {
        self.settled = true;
        (self.message.clone(), self.attempt)
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if !self.settled {
            let _ = self.acker.nack(&self.tag, &self.message, self.attempt);
        }
    }
}

/// A stream of deliveries for one consumer-group member.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    pub fn new(receiver: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self { receiver }
    }

    /// Wait for the next delivery. `None` once the bus side is closed.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.receiver.try_recv().ok()
    }

    /// Stop accepting new deliveries; already-queued ones can still be received.
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

/// Transport-agnostic message bus.
///
/// ## Delivery Guarantees
///
/// - `publish` returning `Ok` means the transport accepted the message
/// - every subscriber group receives each matching message at least once
/// - members of the same group compete: one member gets each delivery
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, message: BusMessage) -> Result<(), BusError>;

    async fn subscribe(&self, group: &str, patterns: &[TopicPattern]) -> Result<Subscription, BusError>;
}

#[async_trait]
impl<B> MessageBus for Arc<B>
where
    B: MessageBus + ?Sized,
{
    async fn publish(&self, message: BusMessage) -> Result<(), BusError> {
        (**self).publish(message).await
    }

    async fn subscribe(&self, group: &str, patterns: &[TopicPattern]) -> Result<Subscription, BusError> {
        (**self).subscribe(group, patterns).await
    }
}
