//! Postgres read store.
//!
//! Each collection is a table (`"Entity_<Type>"`) keyed by
//! `(tenant_id, aggregate_id)` holding the full document as JSONB; see
//! [`crate::pg::collection_table_ddl`]. The version guard runs inside the
//! upsert statement itself:
//!
//! ```sql
//! INSERT .. ON CONFLICT (tenant_id, aggregate_id) DO UPDATE .. WHERE version < EXCLUDED.version
//! ```
//!
//! so concurrent deliveries of different versions converge on the highest.
//!
//! `find` pushes top-level string equalities down as
//! `(document #>> '{Field}') = $n`, the expression the index backend builds
//! on, unless the field has ever held an array in that collection
//! (`projection_array_fields`); array membership is left to the in-process
//! filter.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{Span, instrument};

use smartproj_core::{AggregateId, TenantId};

use super::filter;
use super::read_store::{
    ConsumedEventRecord, FindQuery, FindResult, ProjectionDocument, ReadStore, ReadStoreError, SYSTEM_FIELDS, UpsertOutcome,
};
use crate::pg::{ensure_collection_table, field_expression, is_safe_name, limit_param, quote_ident};

pub const READ_STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS projection_consumed_events (
    id           BIGSERIAL PRIMARY KEY,
    topic        TEXT NOT NULL,
    key          TEXT NULL,
    received_at  TIMESTAMPTZ NOT NULL,
    processed    BOOLEAN NOT NULL
);

CREATE TABLE IF NOT EXISTS projection_array_fields (
    collection   TEXT NOT NULL,
    field        TEXT NOT NULL,
    PRIMARY KEY (collection, field)
);
"#;

#[derive(Debug, Clone)]
pub struct PostgresReadStore {
    pool: Arc<PgPool>,
    ensured: Arc<Mutex<HashSet<String>>>,
    /// `(collection, field)` pairs already recorded as array-valued.
    array_fields: Arc<Mutex<HashSet<(String, String)>>>,
}

impl PostgresReadStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            ensured: Arc::new(Mutex::new(HashSet::new())),
            array_fields: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub async fn ensure_schema(&self) -> Result<(), ReadStoreError> {
        sqlx::raw_sql(READ_STORE_SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    /// Validate the name and create the table on first use.
    async fn collection_table(&self, collection: &str) -> Result<String, ReadStoreError> {
        if !is_safe_name(collection) {
            return Err(ReadStoreError::InvalidCollection(collection.to_string()));
        }
        let known = self.ensured.lock().map(|set| set.contains(collection)).unwrap_or(false);
        if !known {
            ensure_collection_table(&self.pool, collection)
                .await
                .map_err(|e| map_sqlx_error("ensure_collection_table", e))?;
            if let Ok(mut set) = self.ensured.lock() {
                set.insert(collection.to_string());
            }
        }
        Ok(quote_ident(collection))
    }

    /// Record the document's array-valued top-level fields before it is
    /// written, so no reader can see the array without the record.
    async fn record_array_fields(&self, collection: &str, document: &ProjectionDocument) -> Result<(), ReadStoreError> {
        let fresh: Vec<String> = {
            let known = self.array_fields.lock().ok();
            document
                .body
                .iter()
                .filter(|(_, value)| value.is_array())
                .map(|(field, _)| field.clone())
                .filter(|field| {
                    !known
                        .as_ref()
                        .is_some_and(|set| set.contains(&(collection.to_string(), field.clone())))
                })
                .collect()
        };
        if fresh.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "INSERT INTO projection_array_fields (collection, field) SELECT $1, unnest($2::text[]) ON CONFLICT DO NOTHING",
        )
        .bind(collection)
        .bind(&fresh)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_array_fields", e))?;
        if let Ok(mut known) = self.array_fields.lock() {
            known.extend(fresh.into_iter().map(|field| (collection.to_string(), field)));
        }
        Ok(())
    }

    async fn array_fields(&self, collection: &str) -> Result<HashSet<String>, ReadStoreError> {
        let rows = sqlx::query("SELECT field FROM projection_array_fields WHERE collection = $1")
            .bind(collection)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("array_fields", e))?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("field").map_err(|e| map_sqlx_error("array_fields", e)))
            .collect()
    }
}

#[async_trait]
impl ReadStore for PostgresReadStore {
    #[instrument(
        skip(self, document),
        fields(tenant_id = %document.tenant_id, aggregate_id = %document.aggregate_id, version = %document.version),
        err
    )]
    async fn upsert_versioned(
        &self,
        collection: &str,
        document: &ProjectionDocument,
    ) -> Result<UpsertOutcome, ReadStoreError> {
        let table = self.collection_table(collection).await?;
        self.record_array_fields(collection, document).await?;
        let sql = format!(
            r#"
            INSERT INTO {table} AS t (tenant_id, aggregate_id, version, projected_at, document)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (tenant_id, aggregate_id) DO UPDATE
            SET version = EXCLUDED.version, projected_at = EXCLUDED.projected_at, document = EXCLUDED.document
            WHERE t.version < EXCLUDED.version
            RETURNING (xmax = 0) AS inserted
            "#
        );
        let row = sqlx::query(&sql)
            .bind(document.tenant_id.as_uuid())
            .bind(document.aggregate_id.as_uuid())
            .bind(document.version.as_i64())
            .bind(document.projected_at)
            .bind(Json(document.to_json()))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("upsert_versioned", e))?;

        match row {
            None => Ok(UpsertOutcome::Stale),
            Some(row) => {
                let inserted: bool = row.try_get("inserted").map_err(|e| map_sqlx_error("upsert_versioned", e))?;
                Ok(if inserted { UpsertOutcome::Inserted } else { UpsertOutcome::Replaced })
            }
        }
    }

    #[instrument(skip(self), err)]
    async fn get(
        &self,
        collection: &str,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Option<ProjectionDocument>, ReadStoreError> {
        let table = self.collection_table(collection).await?;
        let sql = format!("SELECT document FROM {table} WHERE tenant_id = $1 AND aggregate_id = $2");
        let row = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(aggregate_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| document_from_row(&r)).transpose()
    }

    /// String equalities on scalar fields are pushed down; the full filter, the
    /// sort and the limit are applied to the fetched rows.
    #[instrument(skip(self, query), fields(examined = tracing::field::Empty), err)]
    async fn find(
        &self,
        collection: &str,
        tenant_id: TenantId,
        query: &FindQuery,
    ) -> Result<FindResult, ReadStoreError> {
        let table = self.collection_table(collection).await?;
        let arrays = self.array_fields(collection).await?;
        let clauses = pushdown_clauses(&query.filter, &arrays);
        let sql = find_sql(&table, &clauses);
        let mut statement = sqlx::query(&sql).bind(tenant_id.as_uuid());
        for (_, value) in &clauses {
            statement = statement.bind(*value);
        }
        let rows = statement
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find", e))?;

        let examined = rows.len() as u64;
        let mut found: Vec<(JsonValue, ProjectionDocument)> = Vec::with_capacity(rows.len());
        for row in &rows {
            let json: Json<JsonValue> = row.try_get("document").map_err(|e| map_sqlx_error("find", e))?;
            if filter::matches(&json.0, &query.filter) {
                let doc = ProjectionDocument::from_json(json.0.clone())?;
                found.push((json.0, doc));
            }
        }

        if query.sort.is_empty() {
            found.sort_by_key(|(_, d)| d.aggregate_id);
        } else {
            filter::sort_documents(&mut found, &query.sort, |(json, _)| json);
        }
        if let Some(limit) = query.limit {
            found.truncate(limit);
        }

        Span::current().record("examined", examined);
        Ok(FindResult {
            documents: found.into_iter().map(|(_, d)| d).collect(),
            docs_examined: examined,
        })
    }

    #[instrument(skip(self, record), fields(topic = %record.topic), err)]
    async fn log_consumed(&self, record: ConsumedEventRecord) -> Result<(), ReadStoreError> {
        sqlx::query(
            "INSERT INTO projection_consumed_events (topic, key, received_at, processed) VALUES ($1, $2, $3, $4)",
        )
        .bind(&record.topic)
        .bind(&record.key)
        .bind(record.received_at)
        .bind(record.processed)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("log_consumed", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn consumed_log(&self, limit: usize) -> Result<Vec<ConsumedEventRecord>, ReadStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT topic, key, received_at, processed FROM (
                SELECT id, topic, key, received_at, processed FROM projection_consumed_events
                ORDER BY id DESC LIMIT $1
            ) recent
            ORDER BY id ASC
            "#,
        )
        .bind(limit_param(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("consumed_log", e))?;

        rows.iter()
            .map(|row| {
                let decode = |e| map_sqlx_error("decode_consumed_event", e);
                Ok(ConsumedEventRecord {
                    topic: row.try_get("topic").map_err(decode)?,
                    key: row.try_get("key").map_err(decode)?,
                    received_at: row.try_get("received_at").map_err(decode)?,
                    processed: row.try_get("processed").map_err(decode)?,
                })
            })
            .collect()
    }
}

/// Equalities the database can answer exactly: plain strings on fields that
/// never held an array. System fields are promoted columns of other types.
fn pushdown_clauses<'a>(filter: &'a JsonValue, array_fields: &HashSet<String>) -> Vec<(&'a str, &'a str)> {
    filter::string_equalities(filter)
        .into_iter()
        .filter(|(field, _)| is_safe_name(field) && !SYSTEM_FIELDS.contains(field) && !array_fields.contains(*field))
        .collect()
}

fn find_sql(table: &str, clauses: &[(&str, &str)]) -> String {
    let mut sql = format!("SELECT document FROM {table} WHERE tenant_id = $1");
    for (n, (field, _)) in clauses.iter().enumerate() {
        sql.push_str(&format!(" AND {} = ${}", field_expression(field), n + 2));
    }
    sql
}

fn document_from_row(row: &sqlx::postgres::PgRow) -> Result<ProjectionDocument, ReadStoreError> {
    let json: Json<JsonValue> = row
        .try_get("document")
        .map_err(|e| map_sqlx_error("decode_document", e))?;
    ProjectionDocument::from_json(json.0)
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> ReadStoreError {
    match err {
        sqlx::Error::Database(db_err) => database_error(operation, db_err.code().as_deref(), db_err.message()),
        sqlx::Error::PoolClosed => ReadStoreError::Storage(format!("connection pool closed in {operation}")),
        _ => ReadStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

/// Classify a server error by SQLSTATE. Integrity violations (class 23) and
/// data exceptions (class 22) will fail again on redelivery.
fn database_error(operation: &str, code: Option<&str>, message: &str) -> ReadStoreError {
    let detail = format!("database error in {operation}: {message}");
    match code {
        Some(code) if code.starts_with("23") => ReadStoreError::Conflict(detail),
        Some(code) if code.starts_with("22") => ReadStoreError::InvalidDocument(detail),
        _ => ReadStoreError::Storage(detail),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use smartproj_core::FailureKind;

    use super::*;

    #[test]
    fn constraint_violations_are_data_errors() {
        let unique = database_error("upsert_versioned", Some("23505"), "duplicate key value violates unique constraint");
        assert!(matches!(unique, ReadStoreError::Conflict(_)));
        assert_eq!(unique.kind(), FailureKind::Data);

        let bad_value = database_error("upsert_versioned", Some("22P02"), "invalid input syntax");
        assert_eq!(bad_value.kind(), FailureKind::Data);

        let deadlock = database_error("upsert_versioned", Some("40P01"), "deadlock detected");
        assert_eq!(deadlock.kind(), FailureKind::Transient);
        assert_eq!(database_error("get", None, "gone").kind(), FailureKind::Transient);
    }

    #[test]
    fn string_equalities_use_the_indexed_expression() {
        let filter = json!({"Status": "Open", "Total": {"$gt": 5}, "Region": "EU", "IsActive": true});
        let clauses = pushdown_clauses(&filter, &HashSet::new());
        assert_eq!(clauses, vec![("Status", "Open"), ("Region", "EU")]);
        assert_eq!(
            find_sql("\"Entity_Order\"", &clauses),
            "SELECT document FROM \"Entity_Order\" WHERE tenant_id = $1 \
             AND (document #>> '{Status}') = $2 AND (document #>> '{Region}') = $3"
        );
    }

    #[test]
    fn array_and_system_fields_stay_in_process() {
        let filter = json!({"Tags": "rush", "_id": "x", "AggregateType": "Order", "Status": "Open"});
        let arrays = HashSet::from(["Tags".to_string()]);
        assert_eq!(pushdown_clauses(&filter, &arrays), vec![("Status", "Open")]);
        assert_eq!(
            find_sql("t", &pushdown_clauses(&json!({"Tags": "rush"}), &arrays)),
            "SELECT document FROM t WHERE tenant_id = $1"
        );
    }
}
