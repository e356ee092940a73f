//! Tenant-isolated projection storage.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use smartproj_core::{AggregateId, FailureKind, TenantId, Version, VersionDecision};

use super::filter;
use crate::query_patterns::SortField;

pub const FIELD_ID: &str = "_id";
pub const FIELD_TENANT_ID: &str = "TenantId";
pub const FIELD_AGGREGATE_TYPE: &str = "AggregateType";
pub const FIELD_VERSION: &str = "Version";
pub const FIELD_PROJECTED_AT: &str = "_projectedAt";

/// Fields owned by the pipeline; projected bodies never carry them.
pub const SYSTEM_FIELDS: [&str; 5] = [FIELD_ID, FIELD_TENANT_ID, FIELD_AGGREGATE_TYPE, FIELD_VERSION, FIELD_PROJECTED_AT];

/// One projected aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionDocument {
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub version: Version,
    pub projected_at: DateTime<Utc>,
    /// Projected attributes in write order; system fields excluded.
    pub body: Map<String, JsonValue>,
}

impl ProjectionDocument {
    pub fn new(
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        version: Version,
        body: Map<String, JsonValue>,
    ) -> Self {
        let mut body = body;
        body.retain(|k, _| !SYSTEM_FIELDS.contains(&k.as_str()));
        Self {
            tenant_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            version,
            projected_at: Utc::now(),
            body,
        }
    }

    /// Full stored document: body first, then system fields.
    pub fn to_json(&self) -> JsonValue {
        let mut doc = self.body.clone();
        doc.insert(FIELD_ID.to_string(), JsonValue::String(self.aggregate_id.to_string()));
        doc.insert(FIELD_TENANT_ID.to_string(), JsonValue::String(self.tenant_id.to_string()));
        doc.insert(FIELD_AGGREGATE_TYPE.to_string(), JsonValue::String(self.aggregate_type.clone()));
        doc.insert(FIELD_VERSION.to_string(), JsonValue::from(self.version.as_i64()));
        doc.insert(
            FIELD_PROJECTED_AT.to_string(),
            JsonValue::String(self.projected_at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)),
        );
        JsonValue::Object(doc)
    }

    /// Inverse of [`ProjectionDocument::to_json`].
    pub fn from_json(value: JsonValue) -> Result<Self, ReadStoreError> {
        let JsonValue::Object(mut map) = value else {
            return Err(ReadStoreError::InvalidDocument("document is not an object".to_string()));
        };
        let mut take_str = |field: &str| -> Result<String, ReadStoreError> {
            match map.shift_remove(field) {
                Some(JsonValue::String(s)) => Ok(s),
                _ => Err(ReadStoreError::InvalidDocument(format!("missing or non-string '{field}'"))),
            }
        };
        let aggregate_id = take_str(FIELD_ID)?;
        let tenant_id = take_str(FIELD_TENANT_ID)?;
        let aggregate_type = take_str(FIELD_AGGREGATE_TYPE)?;
        let projected_at = take_str(FIELD_PROJECTED_AT)?;
        let version = map
            .shift_remove(FIELD_VERSION)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| ReadStoreError::InvalidDocument(format!("missing or non-integer '{FIELD_VERSION}'")))?;

        let invalid = |what: &str, e: &dyn std::fmt::Display| ReadStoreError::InvalidDocument(format!("{what}: {e}"));
        Ok(Self {
            tenant_id: tenant_id.parse().map_err(|e| invalid("tenant id", &e))?,
            aggregate_id: aggregate_id.parse().map_err(|e| invalid("aggregate id", &e))?,
            aggregate_type,
            version: Version::from_i64(version),
            projected_at: DateTime::parse_from_rfc3339(&projected_at)
                .map_err(|e| invalid("projected at", &e))?
                .with_timezone(&Utc),
            body: map,
        })
    }

    /// Body field, or a system field by its document name.
    pub fn field(&self, name: &str) -> Option<JsonValue> {
        match name {
            FIELD_ID | FIELD_TENANT_ID | FIELD_AGGREGATE_TYPE | FIELD_VERSION | FIELD_PROJECTED_AT => {
                self.to_json().get(name).cloned()
            }
            _ => self.body.get(name).cloned(),
        }
    }
}

/// Result of a version-guarded upsert. `Stale` covers duplicates and
/// out-of-order deliveries; none of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
    Stale,
}

impl From<VersionDecision> for UpsertOutcome {
    fn from(decision: VersionDecision) -> Self {
        match decision {
            VersionDecision::Insert => UpsertOutcome::Inserted,
            VersionDecision::Replace => UpsertOutcome::Replaced,
            VersionDecision::Discard => UpsertOutcome::Stale,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindQuery {
    pub filter: JsonValue,
    pub sort: Vec<SortField>,
    pub limit: Option<usize>,
}

impl FindQuery {
    pub fn new(filter: JsonValue) -> Self {
        Self {
            filter,
            sort: Vec::new(),
            limit: None,
        }
    }

    pub fn sort_by(mut self, field: SortField) -> Self {
        self.sort.push(field);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindResult {
    pub documents: Vec<ProjectionDocument>,
    /// Documents the backend had to look at to answer.
    pub docs_examined: u64,
}

/// Audit entry for one consumed delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConsumedEventRecord {
    pub topic: String,
    pub key: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadStoreError {
    #[error("read store unavailable: {0}")]
    Storage(String),
    #[error("invalid projection document: {0}")]
    InvalidDocument(String),
    #[error("invalid collection name '{0}'")]
    InvalidCollection(String),
    /// The document violates a constraint of the collection, e.g. a unique index.
    #[error("document rejected by a collection constraint: {0}")]
    Conflict(String),
}

impl ReadStoreError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ReadStoreError::Storage(_) => FailureKind::Transient,
            ReadStoreError::InvalidDocument(_) => FailureKind::Data,
            ReadStoreError::InvalidCollection(_) => FailureKind::Configuration,
            ReadStoreError::Conflict(_) => FailureKind::Data,
        }
    }
}

/// Projection read store.
///
/// All document operations are scoped to one tenant; a document is keyed by
/// `(tenant_id, aggregate_id)` within a collection.
#[async_trait]
pub trait ReadStore: Send + Sync {
    /// Insert, replace wholesale if the stored version is older, else discard.
    async fn upsert_versioned(
        &self,
        collection: &str,
        document: &ProjectionDocument,
    ) -> Result<UpsertOutcome, ReadStoreError>;

    async fn get(
        &self,
        collection: &str,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Option<ProjectionDocument>, ReadStoreError>;

    async fn find(&self, collection: &str, tenant_id: TenantId, query: &FindQuery)
    -> Result<FindResult, ReadStoreError>;

    async fn log_consumed(&self, record: ConsumedEventRecord) -> Result<(), ReadStoreError>;

    /// Most recent audit entries, oldest first.
    async fn consumed_log(&self, limit: usize) -> Result<Vec<ConsumedEventRecord>, ReadStoreError>;
}

#[async_trait]
impl<S> ReadStore for Arc<S>
where
    S: ReadStore + ?Sized,
{
    async fn upsert_versioned(
        &self,
        collection: &str,
        document: &ProjectionDocument,
    ) -> Result<UpsertOutcome, ReadStoreError> {
        (**self).upsert_versioned(collection, document).await
    }

    async fn get(
        &self,
        collection: &str,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Option<ProjectionDocument>, ReadStoreError> {
        (**self).get(collection, tenant_id, aggregate_id).await
    }

    async fn find(
        &self,
        collection: &str,
        tenant_id: TenantId,
        query: &FindQuery,
    ) -> Result<FindResult, ReadStoreError> {
        (**self).find(collection, tenant_id, query).await
    }

    async fn log_consumed(&self, record: ConsumedEventRecord) -> Result<(), ReadStoreError> {
        (**self).log_consumed(record).await
    }

    async fn consumed_log(&self, limit: usize) -> Result<Vec<ConsumedEventRecord>, ReadStoreError> {
        (**self).consumed_log(limit).await
    }
}

const DEFAULT_LOG_CAPACITY: usize = 10_000;

type Collection = HashMap<(TenantId, AggregateId), ProjectionDocument>;

/// In-memory read store for tests/dev.
#[derive(Debug)]
pub struct InMemoryReadStore {
    collections: RwLock<HashMap<String, Collection>>,
    consumed: RwLock<VecDeque<ConsumedEventRecord>>,
    log_capacity: usize,
}

impl Default for InMemoryReadStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryReadStore {
    pub fn new() -> Self {
        Self::with_log_capacity(DEFAULT_LOG_CAPACITY)
    }

    /// Keep at most `capacity` audit entries (oldest evicted first).
    pub fn with_log_capacity(capacity: usize) -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            consumed: RwLock::new(VecDeque::new()),
            log_capacity: capacity.max(1),
        }
    }

    /// Documents in `collection` across all tenants.
    pub fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .map(|c| c.get(collection).map_or(0, HashMap::len))
            .unwrap_or(0)
    }

    fn poisoned() -> ReadStoreError {
        ReadStoreError::Storage("read store lock poisoned".to_string())
    }
}

#[async_trait]
impl ReadStore for InMemoryReadStore {
    async fn upsert_versioned(
        &self,
        collection: &str,
        document: &ProjectionDocument,
    ) -> Result<UpsertOutcome, ReadStoreError> {
        if collection.is_empty() {
            return Err(ReadStoreError::InvalidCollection(collection.to_string()));
        }
        let mut collections = self.collections.write().map_err(|_| Self::poisoned())?;
        let docs = collections.entry(collection.to_string()).or_default();
        let key = (document.tenant_id, document.aggregate_id);

        let decision = Version::guard(docs.get(&key).map(|d| d.version), document.version);
        if decision.writes() {
            docs.insert(key, document.clone());
        }
        Ok(decision.into())
    }

    async fn get(
        &self,
        collection: &str,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Option<ProjectionDocument>, ReadStoreError> {
        let collections = self.collections.read().map_err(|_| Self::poisoned())?;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.get(&(tenant_id, aggregate_id)))
            .cloned())
    }

    async fn find(
        &self,
        collection: &str,
        tenant_id: TenantId,
        query: &FindQuery,
    ) -> Result<FindResult, ReadStoreError> {
        let collections = self.collections.read().map_err(|_| Self::poisoned())?;
        let Some(docs) = collections.get(collection) else {
            return Ok(FindResult::default());
        };

        let mut examined = 0u64;
        let mut found: Vec<(JsonValue, &ProjectionDocument)> = Vec::new();
        for doc in docs.values().filter(|d| d.tenant_id == tenant_id) {
            examined += 1;
            let json = doc.to_json();
            if filter::matches(&json, &query.filter) {
                found.push((json, doc));
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

        Ok(FindResult {
            documents: found.into_iter().map(|(_, d)| d.clone()).collect(),
            docs_examined: examined,
        })
    }

    async fn log_consumed(&self, record: ConsumedEventRecord) -> Result<(), ReadStoreError> {
        let mut log = self.consumed.write().map_err(|_| Self::poisoned())?;
        if log.len() >= self.log_capacity {
            log.pop_front();
        }
        log.push_back(record);
        Ok(())
    }

    async fn consumed_log(&self, limit: usize) -> Result<Vec<ConsumedEventRecord>, ReadStoreError> {
        let log = self.consumed.read().map_err(|_| Self::poisoned())?;
        let skip = log.len().saturating_sub(limit);
        Ok(log.iter().skip(skip).cloned().collect())
    }
}
