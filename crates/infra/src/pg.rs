//! Postgres helpers shared by the outbox, read store and index backends.

use sqlx::PgPool;

/// Postgres truncates identifiers beyond this many bytes.
pub(crate) const MAX_IDENTIFIER_LEN: usize = 63;

/// Projection collection table: one row per `(tenant, aggregate)` with the
/// document as JSONB and the system fields promoted to columns.
pub(crate) fn collection_table_ddl(collection: &str) -> String {
    let table = quote_ident(collection);
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            tenant_id     UUID NOT NULL,
            aggregate_id  UUID NOT NULL,
            version       BIGINT NOT NULL,
            projected_at  TIMESTAMPTZ NOT NULL,
            document      JSONB NOT NULL,
            PRIMARY KEY (tenant_id, aggregate_id)
        )
        "#
    )
}

pub(crate) async fn ensure_collection_table(pool: &PgPool, collection: &str) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(&collection_table_ddl(collection)).execute(pool).await?;
    Ok(())
}

/// Double-quote an identifier, doubling embedded quotes.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Single-quote a string literal, doubling embedded quotes.
pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Collection and field names end up in DDL; keep them to a safe alphabet.
pub(crate) fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 120
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '$' | '*'))
}

/// Column or JSON text expression for a document field. Expression indexes
/// and query predicates both go through here so the planner can match them.
pub(crate) fn field_expression(field: &str) -> String {
    match field {
        "TenantId" => "tenant_id".to_string(),
        "_id" => "aggregate_id".to_string(),
        "Version" => "version".to_string(),
        "_projectedAt" => "projected_at".to_string(),
        other => {
            let path = other.split('.').collect::<Vec<_>>().join(",");
            format!("(document #>> {})", quote_literal(&format!("{{{path}}}")))
        }
    }
}

pub(crate) fn is_promoted(field: &str) -> bool {
    matches!(field, "TenantId" | "_id" | "Version" | "_projectedAt")
}

pub(crate) fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}

/// Short, stable physical name for `collection` + `name` that fits the
/// identifier limit.
pub(crate) fn physical_name(collection: &str, name: &str) -> String {
    let full = format!("{collection}__{name}");
    if full.len() <= MAX_IDENTIFIER_LEN {
        return full;
    }
    let hash = blake3::hash(full.as_bytes()).to_hex();
    let mut prefix: String = full.chars().take(MAX_IDENTIFIER_LEN - 18).collect();
    while prefix.len() > MAX_IDENTIFIER_LEN - 18 {
        prefix.pop();
    }
    format!("{prefix}__{}", &hash.as_str()[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("Entity_Order"), "\"Entity_Order\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn unsafe_names_are_rejected() {
        assert!(is_safe_name("Entity_SalesOrder"));
        assert!(is_safe_name("Lines.0.Sku"));
        assert!(!is_safe_name(""));
        assert!(!is_safe_name("x'; DROP TABLE y; --"));
        assert!(!is_safe_name("has space"));
    }

    #[test]
    fn long_physical_names_fit_the_limit() {
        let short = physical_name("Entity_Order", "idx_tenantId");
        assert_eq!(short, "Entity_Order__idx_tenantId");

        let long = physical_name("Entity_SomeVeryLongAggregateTypeName", "auto_customerid_status_documentdate_1234abcd");
        assert!(long.len() <= MAX_IDENTIFIER_LEN);
        assert_eq!(
            long,
            physical_name("Entity_SomeVeryLongAggregateTypeName", "auto_customerid_status_documentdate_1234abcd")
        );
    }
}
