//! Postgres index backend.
//!
//! Logical indexes are recorded in `projection_index_catalog`; the catalog row
//! is the unit of atomicity, so two instances racing on the same name agree on
//! a single winner and compare specs against it. The physical index is an
//! expression index over the collection table (see [`crate::pg`]):
//!
//! | Key | Expression |
//! |-----|------------|
//! | `TenantId`, `_id`, `Version`, `_projectedAt` | promoted column |
//! | any other field (dotted paths allowed) | `document #>> '{path}'` |
//! | `Text` | GIN over `to_tsvector('simple', ..)` |
//! | `Hashed` | `USING hash`, single key |
//! | `Wildcard` | GIN `jsonb_path_ops` over the whole document |
//!
//! Unique indexes are scoped per tenant: `tenant_id` leads the key list.
//! Expiry is not native; [`PostgresIndexBackend::purge_expired`] deletes
//! documents past the `expire_after_seconds` of any catalogued index.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{Span, error, instrument, warn};

use super::backend::{CreateOutcome, IndexBackend, IndexDefinition, IndexError, IndexKey};
use crate::pg::{ensure_collection_table, field_expression, is_promoted, is_safe_name, physical_name, quote_ident, quote_literal};

pub const INDEX_CATALOG_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS projection_index_catalog (
    collection     TEXT NOT NULL,
    name           TEXT NOT NULL,
    physical_name  TEXT NOT NULL,
    definition     JSONB NOT NULL,
    created_at     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (collection, name)
);
"#;

const MAX_EXPIRY_SECONDS: i64 = 100 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct PostgresIndexBackend {
    pool: Arc<PgPool>,
}

impl PostgresIndexBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    pub async fn ensure_schema(&self) -> Result<(), IndexError> {
        sqlx::raw_sql(INDEX_CATALOG_SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    /// Delete documents older than the shortest expiry recorded for `collection`.
    #[instrument(skip(self), fields(purged = tracing::field::Empty), err)]
    pub async fn purge_expired(&self, collection: &str) -> Result<u64, IndexError> {
        let Some(seconds) = self
            .list_indexes(collection)
            .await?
            .into_iter()
            .filter_map(|d| d.expire_after_seconds)
            .min()
        else {
            return Ok(0);
        };

        let seconds = i64::try_from(seconds).unwrap_or(i64::MAX).min(MAX_EXPIRY_SECONDS);
        let cutoff = Utc::now() - chrono::Duration::seconds(seconds);
        let sql = format!("DELETE FROM {} WHERE projected_at < $1", quote_ident(collection));
        let purged = sqlx::query(&sql)
            .bind(cutoff)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_expired", e))?
            .rows_affected();
        Span::current().record("purged", purged);
        Ok(purged)
    }

    /// Undo a failed build: a failed `CREATE INDEX CONCURRENTLY` leaves an
    /// INVALID index that `IF NOT EXISTS` would skip, so it goes before the
    /// catalog row does.
    async fn release_failed_build(&self, collection: &str, name: &str, physical: &str) -> Result<(), IndexError> {
        sqlx::raw_sql(&drop_index_sql(physical, true))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("drop_failed_index", e))?;
        sqlx::query("DELETE FROM projection_index_catalog WHERE collection = $1 AND name = $2")
            .bind(collection)
            .bind(name)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("release_catalog_entry", e))?;
        Ok(())
    }

    async fn catalogued(&self, collection: &str, name: &str) -> Result<Option<IndexDefinition>, IndexError> {
        let row = sqlx::query("SELECT definition FROM projection_index_catalog WHERE collection = $1 AND name = $2")
            .bind(collection)
            .bind(name)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("catalog_lookup", e))?;
        row.map(|r| {
            r.try_get::<Json<IndexDefinition>, _>("definition")
                .map(|j| j.0)
                .map_err(|e| map_sqlx_error("decode_definition", e))
        })
        .transpose()
    }
}

#[async_trait]
impl IndexBackend for PostgresIndexBackend {
    #[instrument(skip(self, definition), fields(index = %definition.name), err)]
    async fn create_index(&self, collection: &str, definition: &IndexDefinition) -> Result<CreateOutcome, IndexError> {
        definition.validate()?;
        if !is_safe_name(collection) {
            return Err(IndexError::InvalidDefinition(format!("unsafe collection name '{collection}'")));
        }
        let physical = physical_name(collection, &definition.name);
        let ddl = create_index_sql(collection, &physical, definition)?;

        ensure_collection_table(&self.pool, collection)
            .await
            .map_err(|e| map_sqlx_error("ensure_collection_table", e))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO projection_index_catalog (collection, name, physical_name, definition)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (collection, name) DO NOTHING
            RETURNING name
            "#,
        )
        .bind(collection)
        .bind(&definition.name)
        .bind(&physical)
        .bind(Json(definition))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("catalog_insert", e))?;

        if inserted.is_none() {
            let existing = self.catalogued(collection, &definition.name).await?;
            return match existing {
                Some(existing) if existing == *definition => Ok(CreateOutcome::AlreadyExists),
                Some(existing) => Err(IndexError::Conflict {
                    collection: collection.to_string(),
                    name: definition.name.clone(),
                    existing: existing.key_spec(),
                    requested: definition.key_spec(),
                }),
                // dropped between the insert and the lookup
                None => Err(IndexError::Backend(format!(
                    "index '{}' on {collection} vanished during create",
                    definition.name
                ))),
            };
        }

        if let Err(err) = sqlx::raw_sql(&ddl).execute(&*self.pool).await {
            warn!(collection, index = %definition.name, error = %err, "index build failed; releasing catalog entry");
            if let Err(cleanup) = self.release_failed_build(collection, &definition.name, &physical).await {
                error!(
                    collection,
                    index = %definition.name,
                    error = %cleanup,
                    "could not release failed index build; drop the index to retry"
                );
            }
            return Err(map_sqlx_error("create_index", err));
        }
        Ok(CreateOutcome::Created)
    }

    #[instrument(skip(self), err)]
    async fn drop_index(&self, collection: &str, name: &str) -> Result<bool, IndexError> {
        let row = sqlx::query(
            "DELETE FROM projection_index_catalog WHERE collection = $1 AND name = $2 RETURNING physical_name",
        )
        .bind(collection)
        .bind(name)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("catalog_delete", e))?;

        let Some(row) = row else {
            return Ok(false);
        };
        let physical: String = row
            .try_get("physical_name")
            .map_err(|e| map_sqlx_error("decode_physical_name", e))?;
        sqlx::raw_sql(&drop_index_sql(&physical, false))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("drop_index", e))?;
        Ok(true)
    }

    #[instrument(skip(self), err)]
    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexDefinition>, IndexError> {
        let rows = sqlx::query(
            "SELECT definition FROM projection_index_catalog WHERE collection = $1 ORDER BY created_at ASC, name ASC",
        )
        .bind(collection)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_indexes", e))?;

        rows.iter()
            .map(|r| {
                r.try_get::<Json<IndexDefinition>, _>("definition")
                    .map(|j| j.0)
                    .map_err(|e| map_sqlx_error("decode_definition", e))
            })
            .collect()
    }
}

/// `CREATE INDEX` statement for `definition` on the collection table.
pub(crate) fn create_index_sql(collection: &str, physical: &str, def: &IndexDefinition) -> Result<String, IndexError> {
    if let Some(bad) = def.keys.keys().find(|f| !is_safe_name(f)) {
        return Err(IndexError::InvalidDefinition(format!("unsafe field name '{bad}' in index '{}'", def.name)));
    }

    let kinds: Vec<IndexKey> = def.keys.values().copied().collect();
    let (method, columns) = if kinds.iter().all(|k| *k == IndexKey::Text) {
        let doc = def
            .keys
            .keys()
            .map(|f| format!("coalesce({}, '')", field_expression(f)))
            .collect::<Vec<_>>()
            .join(" || ' ' || ");
        ("gin", format!("to_tsvector('simple', {doc})"))
    } else if kinds.contains(&IndexKey::Wildcard) {
        if kinds.len() > 1 {
            return Err(IndexError::Unsupported("wildcard indexes take a single key".to_string()));
        }
        ("gin", "document jsonb_path_ops".to_string())
    } else if kinds.contains(&IndexKey::Hashed) {
        if kinds.len() > 1 || def.unique {
            return Err(IndexError::Unsupported("hashed indexes take a single non-unique key".to_string()));
        }
        let field = def.keys.keys().next().map(String::as_str).unwrap_or_default();
        ("hash", format!("({})", field_expression(field)))
    } else if kinds.iter().all(IndexKey::is_ordered) {
        let mut cols: Vec<String> = Vec::with_capacity(def.keys.len() + 1);
        if def.unique && !def.keys.contains_key("TenantId") {
            cols.push("tenant_id".to_string());
        }
        for (field, key) in &def.keys {
            let mut col = field_expression(field);
            if let Some(collation) = def.collation.as_ref().filter(|_| !is_promoted(field)) {
                col.push_str(&format!(" COLLATE {}", quote_ident(&collation.locale)));
            }
            if *key == IndexKey::Descending {
                col.push_str(" DESC");
            }
            cols.push(col);
        }
        ("btree", cols.join(", "))
    } else {
        return Err(IndexError::Unsupported(format!(
            "index '{}' mixes text keys with other key types",
            def.name
        )));
    };

    if def.unique && method != "btree" {
        return Err(IndexError::Unsupported(format!("unique {method} index '{}'", def.name)));
    }

    let mut predicates: Vec<String> = Vec::new();
    if def.sparse {
        for field in def.keys.keys().filter(|f| !is_promoted(f)) {
            let path = field.split('.').collect::<Vec<_>>().join(",");
            predicates.push(format!("document #> {} IS NOT NULL", quote_literal(&format!("{{{path}}}"))));
        }
    }
    if let Some(filter) = &def.partial_filter {
        predicates.push(format!("document @> {}::jsonb", quote_literal(&filter.to_string())));
    }

    let mut sql = String::from("CREATE ");
    if def.unique {
        sql.push_str("UNIQUE ");
    }
    sql.push_str("INDEX ");
    if def.background {
        sql.push_str("CONCURRENTLY ");
    }
    sql.push_str(&format!(
        "IF NOT EXISTS {} ON {} USING {method} ({columns})",
        quote_ident(physical),
        quote_ident(collection)
    ));
    if !predicates.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&predicates.join(" AND "));
    }
    Ok(sql)
}

fn drop_index_sql(physical: &str, concurrently: bool) -> String {
    let mode = if concurrently { "CONCURRENTLY " } else { "" };
    format!("DROP INDEX {mode}IF EXISTS {}", quote_ident(physical))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> IndexError {
    match err {
        sqlx::Error::Database(db_err) => {
            IndexError::Backend(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => IndexError::Backend(format!("connection pool closed in {operation}")),
        _ => IndexError::Backend(format!("sqlx error in {operation}: {err}")),
    }
}
