//! Postgres-backed outbox.
//!
//! ## Error Mapping
//!
//! | SQLx Error | OutboxError |
//! |------------|-------------|
//! | Database, unique violation (`23505`) on enqueue | `AlreadyExists` |
//! | Any other database error, pool closed, IO | `Storage` (transient) |
//! | Row decode failures | `Storage` |
//!
//! ## Claiming
//!
//! `claim_pending` selects candidates with `FOR UPDATE SKIP LOCKED` and stamps
//! the lease in the same statement, so concurrent publishers never receive the
//! same row for the same lease.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};
use uuid::Uuid;

use smartproj_core::{OutboxMessageId, TenantId};
use smartproj_events::Topic;

use super::store::{OutboxStore, OutboxWriter};
use super::types::{OutboxError, OutboxMessage, OutboxStats, OutboxStatus};
use crate::pg::{is_unique_violation, limit_param};
use crate::retry::RetryBackoff;

/// Outbox table and claim index.
pub const OUTBOX_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS outbox_messages (
    id              UUID PRIMARY KEY,
    tenant_id       UUID NOT NULL,
    topic           TEXT NOT NULL,
    payload         TEXT NOT NULL,
    status          TEXT NOT NULL CHECK (status IN ('pending', 'published', 'failed')),
    created_at      TIMESTAMPTZ NOT NULL,
    processed_at    TIMESTAMPTZ NULL,
    error           TEXT NULL,
    attempts        INTEGER NOT NULL DEFAULT 0,
    last_attempt_at TIMESTAMPTZ NULL,
    claimed_at      TIMESTAMPTZ NULL,
    claimed_by      TEXT NULL
);
CREATE INDEX IF NOT EXISTS idx_outbox_status_created_at ON outbox_messages (status, created_at);
"#;

const SELECT_COLUMNS: &str = "id, tenant_id, topic, payload, status, created_at, processed_at, error, \
     attempts, last_attempt_at, claimed_at, claimed_by";

/// Postgres outbox store (publisher side).
#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: Arc<PgPool>,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    /// Create the outbox table and its `(status, created_at)` index if missing.
    pub async fn ensure_schema(&self) -> Result<(), OutboxError> {
        sqlx::raw_sql(OUTBOX_SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }
}

/// Enqueue handle bound to the caller's write transaction.
///
/// ```ignore
/// let mut tx = pool.begin().await?;
/// save_order(&mut tx, &order).await?;
/// PgOutboxWriter::new(&mut tx).enqueue(message).await?;
/// tx.commit().await?;
/// ```
pub struct PgOutboxWriter<'a, 'c> {
    tx: &'a mut Transaction<'c, Postgres>,
}

impl<'a, 'c> PgOutboxWriter<'a, 'c> {
    pub fn new(tx: &'a mut Transaction<'c, Postgres>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl OutboxWriter for PgOutboxWriter<'_, '_> {
    #[instrument(
        skip(self, message),
        fields(outbox_id = %message.id, tenant_id = %message.tenant_id, topic = %message.topic),
        err
    )]
    async fn enqueue(&mut self, message: OutboxMessage) -> Result<(), OutboxError> {
        sqlx::query(
            r#"
            INSERT INTO outbox_messages
                (id, tenant_id, topic, payload, status, created_at, attempts)
            VALUES ($1, $2, $3, $4, 'pending', $5, 0)
            "#,
        )
        .bind(message.id.as_uuid())
        .bind(message.tenant_id.as_uuid())
        .bind(message.topic.as_str())
        .bind(&message.payload)
        .bind(message.created_at)
        .execute(&mut **self.tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                OutboxError::AlreadyExists(message.id)
            } else {
                map_sqlx_error("enqueue", e)
            }
        })?;
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    #[instrument(skip(self), fields(claimed = tracing::field::Empty), err)]
    async fn claim_pending(
        &self,
        batch_size: usize,
        cutoff: DateTime<Utc>,
        claimer: &str,
    ) -> Result<Vec<OutboxMessage>, OutboxError> {
        let sql = format!(
            r#"
            WITH candidates AS (
                SELECT id FROM outbox_messages
                WHERE status = 'pending' AND (claimed_at IS NULL OR claimed_at < $2)
                ORDER BY created_at ASC, id ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox_messages o
            SET claimed_at = NOW(), claimed_by = $3
            FROM candidates c
            WHERE o.id = c.id
            RETURNING {SELECT_COLUMNS}
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(limit_param(batch_size))
            .bind(cutoff)
            .bind(claimer)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_pending", e))?;

        let mut claimed = rows.iter().map(message_from_row).collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        Span::current().record("claimed", claimed.len());
        Ok(claimed)
    }

    #[instrument(skip(self), fields(outbox_id = %id), err)]
    async fn mark_published(&self, id: OutboxMessageId) -> Result<(), OutboxError> {
        let row = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'published', processed_at = COALESCE(processed_at, NOW()), error = NULL,
                claimed_at = NULL, claimed_by = NULL
            WHERE id = $1 AND status IN ('pending', 'published')
            RETURNING id
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_published", e))?;

        match row {
            Some(_) => Ok(()),
            None => Err(self.transition_error(id, OutboxStatus::Published).await),
        }
    }

    #[instrument(skip(self, error), fields(outbox_id = %id), err)]
    async fn mark_failed(&self, id: OutboxMessageId, error: &str) -> Result<(), OutboxError> {
        let row = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'failed', error = $2, attempts = attempts + 1, last_attempt_at = NOW(),
                claimed_at = NULL, claimed_by = NULL
            WHERE id = $1 AND status <> 'published'
            RETURNING id
            "#,
        )
        .bind(id.as_uuid())
        .bind(error)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", e))?;

        match row {
            Some(_) => Ok(()),
            None => Err(self.transition_error(id, OutboxStatus::Failed).await),
        }
    }

    #[instrument(skip(self, backoff), fields(requeued = tracing::field::Empty), err)]
    async fn requeue_failed(
        &self,
        now: DateTime<Utc>,
        backoff: &RetryBackoff,
        limit: usize,
    ) -> Result<usize, OutboxError> {
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Nothing is due before the first-attempt delay. Scan a window beyond
        // `limit` since rows with longer backoffs are filtered out below.
        let floor = now - chrono::Duration::from_std(backoff.delay_for_attempt(1)).unwrap_or_default();
        let rows = sqlx::query(
            r#"
            SELECT id, attempts, last_attempt_at, created_at FROM outbox_messages
            WHERE status = 'failed' AND COALESCE(last_attempt_at, created_at) <= $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(floor)
        .bind(limit_param(limit.saturating_mul(4)))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("requeue_failed", e))?;

        let mut due: Vec<Uuid> = Vec::new();
        for row in &rows {
            let id: Uuid = row.try_get("id").map_err(|e| map_sqlx_error("requeue_failed", e))?;
            let attempts: i32 = row.try_get("attempts").map_err(|e| map_sqlx_error("requeue_failed", e))?;
            let last: Option<DateTime<Utc>> = row
                .try_get("last_attempt_at")
                .map_err(|e| map_sqlx_error("requeue_failed", e))?;
            let created: DateTime<Utc> = row.try_get("created_at").map_err(|e| map_sqlx_error("requeue_failed", e))?;

            let attempts = u32::try_from(attempts).unwrap_or(0);
            if backoff.is_eligible(last.unwrap_or(created), attempts, now) {
                due.push(id);
            }
            if due.len() >= limit {
                break;
            }
        }

        let requeued = if due.is_empty() {
            0
        } else {
            sqlx::query(
                r#"
                UPDATE outbox_messages
                SET status = 'pending', error = NULL, claimed_at = NULL, claimed_by = NULL
                WHERE id = ANY($1) AND status = 'failed'
                "#,
            )
            .bind(&due)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("requeue_failed", e))?
            .rows_affected()
        };

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;

        let requeued = usize::try_from(requeued).unwrap_or(usize::MAX);
        Span::current().record("requeued", requeued);
        Ok(requeued)
    }

    #[instrument(skip(self), err)]
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxMessage>, OutboxError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM outbox_messages WHERE status = 'pending' \
             ORDER BY created_at ASC, id ASC LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(limit_param(limit))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("pending", e))?;
        rows.iter().map(message_from_row).collect()
    }

    #[instrument(skip(self), fields(outbox_id = %id), err)]
    async fn get(&self, id: OutboxMessageId) -> Result<Option<OutboxMessage>, OutboxError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM outbox_messages WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(message_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn purge_published(&self, older_than: DateTime<Utc>) -> Result<usize, OutboxError> {
        let result = sqlx::query("DELETE FROM outbox_messages WHERE status = 'published' AND processed_at < $1")
            .bind(older_than)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_published", e))?;
        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<OutboxStats, OutboxError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending')                            AS pending,
                COUNT(*) FILTER (WHERE status = 'pending' AND claimed_at IS NOT NULL) AS claimed,
                COUNT(*) FILTER (WHERE status = 'published')                          AS published,
                COUNT(*) FILTER (WHERE status = 'failed')                             AS failed,
                MIN(created_at) FILTER (WHERE status = 'pending')                     AS oldest_pending
            FROM outbox_messages
            "#,
        )
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let count = |name: &str| -> Result<usize, OutboxError> {
            let n: i64 = row.try_get(name).map_err(|e| map_sqlx_error("stats", e))?;
            Ok(usize::try_from(n).unwrap_or(0))
        };

        Ok(OutboxStats {
            pending: count("pending")?,
            claimed: count("claimed")?,
            published: count("published")?,
            failed: count("failed")?,
            oldest_pending: row.try_get("oldest_pending").map_err(|e| map_sqlx_error("stats", e))?,
        })
    }
}

impl PostgresOutboxStore {
    /// Distinguish "no such row" from "row in the wrong state" after a guarded update matched nothing.
    async fn transition_error(&self, id: OutboxMessageId, to: OutboxStatus) -> OutboxError {
        match self.get(id).await {
            Ok(Some(current)) => OutboxError::InvalidTransition {
                id,
                from: current.status,
                to,
            },
            Ok(None) => OutboxError::NotFound(id),
            Err(err) => err,
        }
    }
}

fn message_from_row(row: &PgRow) -> Result<OutboxMessage, OutboxError> {
    let decode = |e: sqlx::Error| map_sqlx_error("decode_outbox_row", e);

    let topic: String = row.try_get("topic").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let attempts: i32 = row.try_get("attempts").map_err(decode)?;

    Ok(OutboxMessage {
        id: OutboxMessageId::from_uuid(row.try_get("id").map_err(decode)?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(decode)?),
        topic: Topic::new(topic).map_err(|e| OutboxError::Storage(format!("stored topic is invalid: {e}")))?,
        payload: row.try_get("payload").map_err(decode)?,
        status: OutboxStatus::parse(&status)
            .ok_or_else(|| OutboxError::Storage(format!("unknown outbox status '{status}'")))?,
        created_at: row.try_get("created_at").map_err(decode)?,
        processed_at: row.try_get("processed_at").map_err(decode)?,
        error: row.try_get("error").map_err(decode)?,
        attempts: u32::try_from(attempts).unwrap_or(0),
        last_attempt_at: row.try_get("last_attempt_at").map_err(decode)?,
        claimed_at: row.try_get("claimed_at").map_err(decode)?,
        claimed_by: row.try_get("claimed_by").map_err(decode)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> OutboxError {
    match err {
        sqlx::Error::Database(db_err) => {
            OutboxError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => OutboxError::Storage(format!("connection pool closed in {operation}")),
        _ => OutboxError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}
