//! Query canonicalization and per-pattern execution statistics.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use smartproj_core::TenantId;

use crate::smart_config::SortDirection;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortField {
    pub field: String,
    pub direction: SortDirection,
}

impl SortField {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Ascending,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Descending,
        }
    }
}

/// A read-store query as it was executed, with its measured cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutedQuery {
    pub tenant_id: TenantId,
    pub aggregate_type: String,
    pub filter: JsonValue,
    pub sort: Vec<SortField>,
    pub execution_time_ms: f64,
    pub docs_examined: u64,
    pub docs_returned: u64,
}

/// Field names referenced by a filter document.
///
/// Logical operators (`$and`, `$or`, `$nor`) are walked; operator objects on a
/// field (`{"Total": {"$gt": 10}}`) count as that field only.
pub fn filter_fields(filter: &JsonValue) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    collect_fields(filter, &mut out);
    out
}

fn collect_fields(filter: &JsonValue, out: &mut BTreeSet<String>) {
    let JsonValue::Object(map) = filter else {
        return;
    };
    for (key, value) in map {
        match key.as_str() {
            "$and" | "$or" | "$nor" => {
                if let JsonValue::Array(clauses) = value {
                    for clause in clauses {
                        collect_fields(clause, out);
                    }
                }
            }
            op if op.starts_with('$') => {}
            field => {
                out.insert(field.to_string());
            }
        }
    }
}

/// Canonical signature of a query: which fields it filters and sorts on.
///
/// Values never take part; field order is irrelevant to identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryShape {
    filter_fields: Vec<String>,
    sort_fields: Vec<SortField>,
}

impl QueryShape {
    pub fn new<I, S>(filter_fields: I, sort_fields: Vec<SortField>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let filter_fields: BTreeSet<String> = filter_fields.into_iter().map(Into::into).collect();
        let mut seen = BTreeSet::new();
        let sort_fields = sort_fields.into_iter().filter(|s| seen.insert(s.field.clone())).collect();
        Self {
            filter_fields: filter_fields.into_iter().collect(),
            sort_fields,
        }
    }

    pub fn of(query: &ExecutedQuery) -> Self {
        Self::new(filter_fields(&query.filter), query.sort.clone())
    }

    /// Sorted, deduplicated.
    pub fn filter_fields(&self) -> &[String] {
        &self.filter_fields
    }

    /// In query order, first occurrence of each field kept.
    pub fn sort_fields(&self) -> &[SortField] {
        &self.sort_fields
    }

    /// blake3 over the sorted filter set and the sorted sort-field set,
    /// truncated to 16 hex characters.
    pub fn pattern_hash(&self) -> String {
        let mut sort: Vec<&str> = self.sort_fields.iter().map(|s| s.field.as_str()).collect();
        sort.sort_unstable();

        let mut hasher = blake3::Hasher::new();
        hasher.update(b"filter:");
        for field in &self.filter_fields {
            hasher.update(field.as_bytes());
            hasher.update(b"\x1f");
        }
        hasher.update(b"|sort:");
        for field in sort {
            hasher.update(field.as_bytes());
            hasher.update(b"\x1f");
        }
        let hex = hasher.finalize().to_hex();
        hex.as_str()[..16].to_string()
    }
}

/// Accumulated statistics of one query shape against one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DetectedQueryPattern {
    pub pattern_hash: String,
    pub collection: String,
    pub filter_fields: Vec<String>,
    pub sort_fields: Vec<SortField>,
    pub execution_count: u64,
    pub average_execution_time_ms: f64,
    pub average_docs_examined: f64,
    pub average_docs_returned: f64,
    pub index_created: bool,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl DetectedQueryPattern {
    pub fn new(collection: impl Into<String>, shape: &QueryShape, now: DateTime<Utc>) -> Self {
        Self {
            pattern_hash: shape.pattern_hash(),
            collection: collection.into(),
            filter_fields: shape.filter_fields().to_vec(),
            sort_fields: shape.sort_fields().to_vec(),
            execution_count: 0,
            average_execution_time_ms: 0.0,
            average_docs_examined: 0.0,
            average_docs_returned: 0.0,
            index_created: false,
            first_seen: now,
            last_seen: now,
        }
    }

    /// Fold one execution into the running averages.
    pub fn record(&mut self, query: &ExecutedQuery, at: DateTime<Utc>) {
        self.execution_count = self.execution_count.saturating_add(1);
        let n = self.execution_count as f64;
        self.average_execution_time_ms += (query.execution_time_ms - self.average_execution_time_ms) / n;
        self.average_docs_examined += (query.docs_examined as f64 - self.average_docs_examined) / n;
        self.average_docs_returned += (query.docs_returned as f64 - self.average_docs_returned) / n;
        if at > self.last_seen {
            self.last_seen = at;
        }
    }

    /// Scale the count down so old traffic fades; averages are kept.
    pub fn decay(&mut self, factor: f64) {
        let factor = factor.clamp(0.0, 1.0);
        self.execution_count = (self.execution_count as f64 * factor).floor() as u64;
    }

    /// Examined/returned ratio, at least 1.
    pub fn selectivity_penalty(&self) -> f64 {
        if self.average_docs_returned <= 0.0 {
            return self.average_docs_examined.max(1.0);
        }
        (self.average_docs_examined / self.average_docs_returned).max(1.0)
    }
}
