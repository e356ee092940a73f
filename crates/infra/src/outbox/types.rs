//! Outbox message model and lifecycle transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use smartproj_core::{FailureKind, OutboxMessageId, TenantId};
use smartproj_events::{EnvelopeError, EventEnvelope, Topic};

/// Outbox row status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Waiting to be handed to the bus (possibly claimed by a publisher).
    Pending,
    /// Accepted by the bus.
    Published,
    /// Last publish attempt failed; the retry sweep moves it back to `Pending`.
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Published => "published",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(OutboxStatus::Pending),
            "published" => Some(OutboxStatus::Published),
            "failed" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

impl core::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message written in the same transaction as the mutation it describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: OutboxMessageId,
    pub tenant_id: TenantId,
    pub topic: Topic,
    /// Encoded [`EventEnvelope`].
    pub payload: String,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Number of failed publish attempts so far.
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Lease start of the publisher currently holding this row.
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
}

impl OutboxMessage {
    pub fn new(tenant_id: TenantId, topic: Topic, payload: impl Into<String>) -> Self {
        Self {
            id: OutboxMessageId::new(),
            tenant_id,
            topic,
            payload: payload.into(),
            status: OutboxStatus::Pending,
            created_at: Utc::now(),
            processed_at: None,
            error: None,
            attempts: 0,
            last_attempt_at: None,
            claimed_at: None,
            claimed_by: None,
        }
    }

    /// Build a pending message carrying `envelope`, addressed to `topic`.
    pub fn from_envelope(envelope: &EventEnvelope, topic: Topic) -> Result<Self, OutboxError> {
        let payload = envelope.encode()?;
        Ok(Self::new(envelope.tenant_id(), topic, payload))
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Pending and either unclaimed or holding a lease that started before `cutoff`.
    pub fn is_claimable(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Pending && self.claimed_at.is_none_or(|at| at < cutoff)
    }

    pub fn claim(&mut self, claimer: &str, now: DateTime<Utc>) {
        self.claimed_at = Some(now);
        self.claimed_by = Some(claimer.to_string());
    }

    pub fn mark_published(&mut self, now: DateTime<Utc>) -> Result<(), OutboxError> {
        match self.status {
            OutboxStatus::Published => Ok(()),
            OutboxStatus::Pending => {
                self.status = OutboxStatus::Published;
                self.processed_at = Some(now);
                self.error = None;
                self.release();
                Ok(())
            }
            from => Err(OutboxError::InvalidTransition {
                id: self.id,
                from,
                to: OutboxStatus::Published,
            }),
        }
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<(), OutboxError> {
        if self.status == OutboxStatus::Published {
            return Err(OutboxError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: OutboxStatus::Failed,
            });
        }
        self.status = OutboxStatus::Failed;
        self.error = Some(error.into());
        self.attempts = self.attempts.saturating_add(1);
        self.last_attempt_at = Some(now);
        self.release();
        Ok(())
    }

    /// `Failed` back to `Pending` with the error cleared. Attempts are kept for backoff.
    pub fn requeue(&mut self) {
        if self.status == OutboxStatus::Failed {
            self.status = OutboxStatus::Pending;
            self.error = None;
            self.release();
        }
    }

    fn release(&mut self) {
        self.claimed_at = None;
        self.claimed_by = None;
    }
}

/// Counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub pending: usize,
    /// Pending rows currently under a publisher lease.
    pub claimed: usize,
    pub published: usize,
    pub failed: usize,
    pub oldest_pending: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OutboxError {
    #[error("outbox message not found: {0}")]
    NotFound(OutboxMessageId),
    #[error("outbox message {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: OutboxMessageId,
        from: OutboxStatus,
        to: OutboxStatus,
    },
    #[error("outbox message already exists: {0}")]
    AlreadyExists(OutboxMessageId),
    #[error("cannot encode outbox payload: {0}")]
    Encode(String),
    #[error("outbox storage error: {0}")]
    Storage(String),
}

impl OutboxError {
    pub fn kind(&self) -> FailureKind {
        match self {
            OutboxError::Storage(_) => FailureKind::Transient,
            OutboxError::NotFound(_)
            | OutboxError::InvalidTransition { .. }
            | OutboxError::AlreadyExists(_)
            | OutboxError::Encode(_) => FailureKind::Data,
        }
    }
}

impl From<EnvelopeError> for OutboxError {
    fn from(err: EnvelopeError) -> Self {
        OutboxError::Encode(err.to_string())
    }
}
