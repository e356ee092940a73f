//! Outbox storage contracts and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use smartproj_core::OutboxMessageId;

use super::types::{OutboxError, OutboxMessage, OutboxStats, OutboxStatus};
use crate::retry::RetryBackoff;

/// Enqueue side of the outbox.
///
/// Implemented only by handles that wrap the caller's open write transaction,
/// so a message can never be committed without the mutation it describes.
#[async_trait]
pub trait OutboxWriter: Send {
    async fn enqueue(&mut self, message: OutboxMessage) -> Result<(), OutboxError>;
}

/// Publisher/operator side of the outbox.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Atomically lease up to `batch_size` pending messages, oldest first.
    ///
    /// A message is claimable when it is unclaimed or its lease started before
    /// `cutoff`. Concurrent callers never receive the same message for the
    /// same lease.
    async fn claim_pending(
        &self,
        batch_size: usize,
        cutoff: DateTime<Utc>,
        claimer: &str,
    ) -> Result<Vec<OutboxMessage>, OutboxError>;

    /// `Status = Published`, `ProcessedAt = now`.
    async fn mark_published(&self, id: OutboxMessageId) -> Result<(), OutboxError>;

    /// `Status = Failed`, `Error = error`.
    async fn mark_failed(&self, id: OutboxMessageId, error: &str) -> Result<(), OutboxError>;

    /// Move up to `limit` failed messages whose backoff elapsed back to `Pending`.
    async fn requeue_failed(
        &self,
        now: DateTime<Utc>,
        backoff: &RetryBackoff,
        limit: usize,
    ) -> Result<usize, OutboxError>;

    /// Pending messages in claim order (claimed or not).
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxMessage>, OutboxError>;

    async fn get(&self, id: OutboxMessageId) -> Result<Option<OutboxMessage>, OutboxError>;

    /// Delete published messages processed before `older_than`.
    async fn purge_published(&self, older_than: DateTime<Utc>) -> Result<usize, OutboxError>;

    async fn stats(&self) -> Result<OutboxStats, OutboxError>;
}

#[async_trait]
impl<S> OutboxStore for Arc<S>
where
    S: OutboxStore + ?Sized,
{
    async fn claim_pending(
        &self,
        batch_size: usize,
        cutoff: DateTime<Utc>,
        claimer: &str,
    ) -> Result<Vec<OutboxMessage>, OutboxError> {
        (**self).claim_pending(batch_size, cutoff, claimer).await
    }

    async fn mark_published(&self, id: OutboxMessageId) -> Result<(), OutboxError> {
        (**self).mark_published(id).await
    }

    async fn mark_failed(&self, id: OutboxMessageId, error: &str) -> Result<(), OutboxError> {
        (**self).mark_failed(id, error).await
    }

    async fn requeue_failed(
        &self,
        now: DateTime<Utc>,
        backoff: &RetryBackoff,
        limit: usize,
    ) -> Result<usize, OutboxError> {
        (**self).requeue_failed(now, backoff, limit).await
    }

    async fn pending(&self, limit: usize) -> Result<Vec<OutboxMessage>, OutboxError> {
        (**self).pending(limit).await
    }

    async fn get(&self, id: OutboxMessageId) -> Result<Option<OutboxMessage>, OutboxError> {
        (**self).get(id).await
    }

    async fn purge_published(&self, older_than: DateTime<Utc>) -> Result<usize, OutboxError> {
        (**self).purge_published(older_than).await
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxError> {
        (**self).stats().await
    }
}

/// In-memory outbox for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    messages: RwLock<HashMap<OutboxMessageId, OutboxMessage>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Open a unit of work. Enqueued messages become visible on
    /// [`InMemoryOutboxTx::commit`]; dropping the handle discards them.
    pub fn begin(&self) -> InMemoryOutboxTx<'_> {
        InMemoryOutboxTx {
            store: self,
            staged: Vec::new(),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<OutboxMessageId, OutboxMessage>>, OutboxError> {
        self.messages
            .read()
            .map_err(|_| OutboxError::Storage("outbox lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<OutboxMessageId, OutboxMessage>>, OutboxError> {
        self.messages
            .write()
            .map_err(|_| OutboxError::Storage("outbox lock poisoned".to_string()))
    }

    fn update<F>(&self, id: OutboxMessageId, f: F) -> Result<(), OutboxError>
    where
        F: FnOnce(&mut OutboxMessage) -> Result<(), OutboxError>,
    {
        let mut messages = self.write()?;
        let msg = messages.get_mut(&id).ok_or(OutboxError::NotFound(id))?;
        f(msg)
    }
}

fn claim_order(a: &OutboxMessage, b: &OutboxMessage) -> core::cmp::Ordering {
    a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id))
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn claim_pending(
        &self,
        batch_size: usize,
        cutoff: DateTime<Utc>,
        claimer: &str,
    ) -> Result<Vec<OutboxMessage>, OutboxError> {
        let now = Utc::now();
        let mut messages = self.write()?;

        let mut candidates: Vec<&mut OutboxMessage> =
            messages.values_mut().filter(|m| m.is_claimable(cutoff)).collect();
        candidates.sort_by(|a, b| claim_order(a, b));

        Ok(candidates
            .into_iter()
            .take(batch_size)
            .map(|m| {
                m.claim(claimer, now);
                m.clone()
            })
            .collect())
    }

    async fn mark_published(&self, id: OutboxMessageId) -> Result<(), OutboxError> {
        self.update(id, |m| m.mark_published(Utc::now()))
    }

    async fn mark_failed(&self, id: OutboxMessageId, error: &str) -> Result<(), OutboxError> {
        self.update(id, |m| m.mark_failed(error, Utc::now()))
    }

    async fn requeue_failed(
        &self,
        now: DateTime<Utc>,
        backoff: &RetryBackoff,
        limit: usize,
    ) -> Result<usize, OutboxError> {
        let mut messages = self.write()?;
        let mut due: Vec<&mut OutboxMessage> = messages
            .values_mut()
            .filter(|m| m.status == OutboxStatus::Failed)
            .filter(|m| {
                let failed_at = m.last_attempt_at.unwrap_or(m.created_at);
                backoff.is_eligible(failed_at, m.attempts, now)
            })
            .collect();
        due.sort_by(|a, b| claim_order(a, b));

        let mut requeued = 0;
        for msg in due.into_iter().take(limit) {
            msg.requeue();
            requeued += 1;
        }
        Ok(requeued)
    }

    async fn pending(&self, limit: usize) -> Result<Vec<OutboxMessage>, OutboxError> {
        let messages = self.read()?;
        let mut pending: Vec<OutboxMessage> = messages
            .values()
            .filter(|m| m.status == OutboxStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(claim_order);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn get(&self, id: OutboxMessageId) -> Result<Option<OutboxMessage>, OutboxError> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn purge_published(&self, older_than: DateTime<Utc>) -> Result<usize, OutboxError> {
        let mut messages = self.write()?;
        let before = messages.len();
        messages.retain(|_, m| {
            !(m.status == OutboxStatus::Published && m.processed_at.is_some_and(|at| at < older_than))
        });
        Ok(before - messages.len())
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxError> {
        let messages = self.read()?;
        let mut stats = OutboxStats::default();
        for m in messages.values() {
            match m.status {
                OutboxStatus::Pending => {
                    stats.pending += 1;
                    if m.claimed_at.is_some() {
                        stats.claimed += 1;
                    }
                    stats.oldest_pending = Some(match stats.oldest_pending {
                        Some(oldest) => oldest.min(m.created_at),
                        None => m.created_at,
                    });
                }
                OutboxStatus::Published => stats.published += 1,
                OutboxStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}

/// Unit of work against [`InMemoryOutboxStore`].
///
/// Stands in for a database transaction: staged messages are applied together
/// on commit or not at all.
#[derive(Debug)]
pub struct InMemoryOutboxTx<'a> {
    store: &'a InMemoryOutboxStore,
    staged: Vec<OutboxMessage>,
}

impl InMemoryOutboxTx<'_> {
    pub fn staged(&self) -> &[OutboxMessage] {
        &self.staged
    }

    pub fn commit(self) -> Result<usize, OutboxError> {
        let mut messages = self.store.write()?;
        if let Some(dup) = self.staged.iter().find(|m| messages.contains_key(&m.id)) {
            return Err(OutboxError::AlreadyExists(dup.id));
        }
        let count = self.staged.len();
        for msg in self.staged {
            messages.insert(msg.id, msg);
        }
        Ok(count)
    }
}

#[async_trait]
impl OutboxWriter for InMemoryOutboxTx<'_> {
    async fn enqueue(&mut self, message: OutboxMessage) -> Result<(), OutboxError> {
        if self.staged.iter().any(|m| m.id == message.id) {
            return Err(OutboxError::AlreadyExists(message.id));
        }
        self.staged.push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Duration as ChronoDuration;
    use smartproj_core::TenantId;
    use smartproj_events::Topic;

    use super::*;

    fn message(topic: &str) -> OutboxMessage {
        OutboxMessage::new(TenantId::new(), Topic::new(topic).unwrap(), "{}")
    }

    async fn committed(store: &InMemoryOutboxStore, msgs: Vec<OutboxMessage>) {
        let mut tx = store.begin();
        for m in msgs {
            tx.enqueue(m).await.unwrap();
        }
        tx.commit().unwrap();
    }

    #[tokio::test]
    async fn enqueue_is_invisible_until_commit() {
        let store = InMemoryOutboxStore::new();
        let mut tx = store.begin();
        tx.enqueue(message("domain.sales.changed")).await.unwrap();

        assert_eq!(store.stats().await.unwrap().pending, 0);
        tx.commit().unwrap();
        assert_eq!(store.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn dropped_unit_of_work_leaves_nothing_behind() {
        let store = InMemoryOutboxStore::new();
        {
            let mut tx = store.begin();
            tx.enqueue(message("domain.sales.changed")).await.unwrap();
        }
        assert!(store.pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claims_oldest_first_and_never_twice() {
        let store = InMemoryOutboxStore::new();
        let t0 = Utc::now() - ChronoDuration::seconds(10);
        let older = message("a.b").with_created_at(t0);
        let newer = message("a.c").with_created_at(t0 + ChronoDuration::seconds(1));
        committed(&store, vec![newer.clone(), older.clone()]).await;

        let cutoff = Utc::now() - ChronoDuration::seconds(60);
        let first = store.claim_pending(1, cutoff, "p1").await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, older.id);

        let second = store.claim_pending(10, cutoff, "p2").await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, newer.id);

        assert!(store.claim_pending(10, cutoff, "p3").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_lease_can_be_reclaimed() {
        let store = InMemoryOutboxStore::new();
        committed(&store, vec![message("a.b")]).await;

        let claimed = store.claim_pending(10, Utc::now() - ChronoDuration::seconds(60), "p1").await.unwrap();
        assert_eq!(claimed.len(), 1);

        // p1 went silent; a cutoff after its lease start makes the row claimable again
        let reclaimed = store
            .claim_pending(10, Utc::now() + ChronoDuration::seconds(1), "p2")
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].claimed_by.as_deref(), Some("p2"));
    }

    #[tokio::test]
    async fn published_message_leaves_the_pending_set() {
        let store = InMemoryOutboxStore::new();
        let msg = message("domain.sales.changed");
        let id = msg.id;
        committed(&store, vec![msg]).await;

        store.claim_pending(10, Utc::now(), "p1").await.unwrap();
        store.mark_published(id).await.unwrap();

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Published);
        assert!(stored.processed_at.is_some());
        assert!(store.pending(100).await.unwrap().iter().all(|m| m.id != id));
    }

    #[tokio::test]
    async fn failed_messages_return_after_backoff() {
        let store = InMemoryOutboxStore::new();
        let msg = message("a.b");
        let id = msg.id;
        committed(&store, vec![msg]).await;
        store.mark_failed(id, "bus unavailable").await.unwrap();

        let backoff = RetryBackoff::fixed(Duration::from_secs(30));
        let now = Utc::now();
        assert_eq!(store.requeue_failed(now, &backoff, 10).await.unwrap(), 0);
        assert_eq!(
            store.requeue_failed(now + ChronoDuration::seconds(31), &backoff, 10).await.unwrap(),
            1
        );

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Pending);
        assert!(stored.error.is_none());
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn purge_only_touches_old_published_rows() {
        let store = InMemoryOutboxStore::new();
        let published = message("a.b");
        let pending = message("a.c");
        let published_id = published.id;
        committed(&store, vec![published, pending]).await;
        store.mark_published(published_id).await.unwrap();

        assert_eq!(store.purge_published(Utc::now() - ChronoDuration::hours(1)).await.unwrap(), 0);
        assert_eq!(store.purge_published(Utc::now() + ChronoDuration::seconds(1)).await.unwrap(), 1);
        assert_eq!(store.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn unknown_ids_are_reported() {
        let store = InMemoryOutboxStore::new();
        let id = OutboxMessageId::new();
        assert_eq!(store.mark_published(id).await, Err(OutboxError::NotFound(id)));
    }
}
