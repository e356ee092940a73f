//! Physical index definitions and the backend contract.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use smartproj_core::FailureKind;

use crate::cancel::Cancelled;
use crate::smart_config::{Collation, IndexConfig, IndexOrigin, IndexType, SortDirection};

/// How one field participates in an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKey {
    Ascending,
    Descending,
    Text,
    Hashed,
    Wildcard,
}

impl IndexKey {
    /// Ordered keys can serve equality filters on a prefix and sorts.
    pub fn is_ordered(&self) -> bool {
        matches!(self, IndexKey::Ascending | IndexKey::Descending)
    }
}

impl From<SortDirection> for IndexKey {
    fn from(value: SortDirection) -> Self {
        match value {
            SortDirection::Ascending => IndexKey::Ascending,
            SortDirection::Descending => IndexKey::Descending,
        }
    }
}

/// An index as the backend builds it.
///
/// Equality compares the physical spec only: `origin` and `background` say
/// who asked and how it was built, not what it is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub keys: IndexMap<String, IndexKey>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub sparse: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_filter: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collation: Option<Collation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_after_seconds: Option<u64>,
    #[serde(default)]
    pub origin: IndexOrigin,
    #[serde(default)]
    pub background: bool,
}

impl PartialEq for IndexDefinition {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.keys == other.keys
            && self.unique == other.unique
            && self.sparse == other.sparse
            && self.partial_filter == other.partial_filter
            && self.collation == other.collation
            && self.expire_after_seconds == other.expire_after_seconds
    }
}

impl IndexDefinition {
    pub fn new<I, S>(name: impl Into<String>, keys: I) -> Self
    where
        I: IntoIterator<Item = (S, IndexKey)>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            keys: keys.into_iter().map(|(f, k)| (f.into(), k)).collect(),
            unique: false,
            sparse: false,
            partial_filter: None,
            collation: None,
            expire_after_seconds: None,
            origin: IndexOrigin::Declared,
            background: false,
        }
    }

    /// Translate a declared index verbatim.
    pub fn from_config(config: &IndexConfig) -> Self {
        let keys = config
            .fields
            .iter()
            .map(|(field, direction)| {
                let key = match config.index_type {
                    IndexType::Text => IndexKey::Text,
                    IndexType::Hashed => IndexKey::Hashed,
                    IndexType::Wildcard => IndexKey::Wildcard,
                    IndexType::Standard | IndexType::Compound => IndexKey::from(*direction),
                };
                (field.clone(), key)
            })
            .collect();

        Self {
            name: config.name.clone(),
            keys,
            unique: config.is_unique,
            sparse: config.is_sparse,
            partial_filter: config.partial_filter_expression.clone(),
            collation: config.collation.clone(),
            expire_after_seconds: config.expire_after_seconds,
            origin: config.origin,
            background: false,
        }
    }

    pub fn with_origin(mut self, origin: IndexOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn expire_after(mut self, seconds: u64) -> Self {
        self.expire_after_seconds = Some(seconds);
        self
    }

    pub fn in_background(mut self) -> Self {
        self.background = true;
        self
    }

    pub fn validate(&self) -> Result<(), IndexError> {
        if self.name.trim().is_empty() {
            return Err(IndexError::InvalidDefinition("index name must not be empty".to_string()));
        }
        if self.keys.is_empty() {
            return Err(IndexError::InvalidDefinition(format!("index '{}' has no keys", self.name)));
        }
        if self.keys.keys().any(|f| f.trim().is_empty()) {
            return Err(IndexError::InvalidDefinition(format!("index '{}' has an empty field name", self.name)));
        }
        Ok(())
    }

    /// Compact human-readable key spec, e.g. `{TenantId: 1, _projectedAt: -1}`.
    pub fn key_spec(&self) -> String {
        let parts: Vec<String> = self
            .keys
            .iter()
            .map(|(field, key)| {
                let k = match key {
                    IndexKey::Ascending => "1",
                    IndexKey::Descending => "-1",
                    IndexKey::Text => "text",
                    IndexKey::Hashed => "hashed",
                    IndexKey::Wildcard => "wildcard",
                };
                format!("{field}: {k}")
            })
            .collect();
        format!("{{{}}}", parts.join(", "))
    }
}

/// What a create call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// Same name and same spec already present.
    AlreadyExists,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    #[error("index '{name}' on {collection} already exists with a different spec (existing {existing}, requested {requested})")]
    Conflict {
        collection: String,
        name: String,
        existing: String,
        requested: String,
    },
    #[error("invalid index definition: {0}")]
    InvalidDefinition(String),
    #[error("index option not supported by this backend: {0}")]
    Unsupported(String),
    #[error("index backend error: {0}")]
    Backend(String),
    #[error("index operation cancelled")]
    Cancelled,
}

impl IndexError {
    pub fn kind(&self) -> FailureKind {
        match self {
            IndexError::Conflict { .. } | IndexError::InvalidDefinition(_) | IndexError::Unsupported(_) => {
                FailureKind::Configuration
            }
            IndexError::Backend(_) | IndexError::Cancelled => FailureKind::Transient,
        }
    }
}

impl From<Cancelled> for IndexError {
    fn from(_: Cancelled) -> Self {
        IndexError::Cancelled
    }
}

/// Where indexes physically live (document store, Postgres, ...).
///
/// `create_index` must be atomic per `(collection, name)`: concurrent creates
/// of the same spec both succeed, a different spec under a taken name fails
/// with [`IndexError::Conflict`].
#[async_trait]
pub trait IndexBackend: Send + Sync {
    async fn create_index(&self, collection: &str, definition: &IndexDefinition) -> Result<CreateOutcome, IndexError>;

    /// `true` if an index was dropped.
    async fn drop_index(&self, collection: &str, name: &str) -> Result<bool, IndexError>;

    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexDefinition>, IndexError>;
}

#[async_trait]
impl<B> IndexBackend for Arc<B>
where
    B: IndexBackend + ?Sized,
{
    async fn create_index(&self, collection: &str, definition: &IndexDefinition) -> Result<CreateOutcome, IndexError> {
        (**self).create_index(collection, definition).await
    }

    async fn drop_index(&self, collection: &str, name: &str) -> Result<bool, IndexError> {
        (**self).drop_index(collection, name).await
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexDefinition>, IndexError> {
        (**self).list_indexes(collection).await
    }
}

/// In-memory index catalog for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryIndexBackend {
    collections: RwLock<HashMap<String, IndexMap<String, IndexDefinition>>>,
    builds: RwLock<HashMap<(String, String), u32>>,
}

impl InMemoryIndexBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times `name` was physically built on `collection`.
    pub fn build_count(&self, collection: &str, name: &str) -> u32 {
        self.builds
            .read()
            .ok()
            .and_then(|b| b.get(&(collection.to_string(), name.to_string())).copied())
            .unwrap_or(0)
    }

    fn poisoned() -> IndexError {
        IndexError::Backend("index catalog lock poisoned".to_string())
    }
}

#[async_trait]
impl IndexBackend for InMemoryIndexBackend {
    async fn create_index(&self, collection: &str, definition: &IndexDefinition) -> Result<CreateOutcome, IndexError> {
        definition.validate()?;
        let mut collections = self.collections.write().map_err(|_| Self::poisoned())?;
        let indexes = collections.entry(collection.to_string()).or_default();

        if let Some(existing) = indexes.get(&definition.name) {
            if existing == definition {
                return Ok(CreateOutcome::AlreadyExists);
            }
            return Err(IndexError::Conflict {
                collection: collection.to_string(),
                name: definition.name.clone(),
                existing: existing.key_spec(),
                requested: definition.key_spec(),
            });
        }

        indexes.insert(definition.name.clone(), definition.clone());
        drop(collections);

        let mut builds = self.builds.write().map_err(|_| Self::poisoned())?;
        *builds
            .entry((collection.to_string(), definition.name.clone()))
            .or_default() += 1;
        Ok(CreateOutcome::Created)
    }

    async fn drop_index(&self, collection: &str, name: &str) -> Result<bool, IndexError> {
        let mut collections = self.collections.write().map_err(|_| Self::poisoned())?;
        Ok(collections
            .get_mut(collection)
            .is_some_and(|indexes| indexes.shift_remove(name).is_some()))
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexDefinition>, IndexError> {
        let collections = self.collections.read().map_err(|_| Self::poisoned())?;
        Ok(collections
            .get(collection)
            .map(|indexes| indexes.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_ignores_origin_and_build_mode() {
        let a = IndexDefinition::new("idx", [("Status", IndexKey::Ascending)]);
        let b = a.clone().with_origin(IndexOrigin::AutoSuggested).in_background();
        assert_eq!(a, b);
        assert_ne!(a, a.clone().unique());
    }

    #[test]
    fn from_config_maps_index_types() {
        let text = IndexConfig::single("idx_text", "Description").with_type(IndexType::Text);
        assert_eq!(IndexDefinition::from_config(&text).keys["Description"], IndexKey::Text);

        let compound = IndexConfig::new(
            "idx_c",
            [("A", SortDirection::Ascending), ("B", SortDirection::Descending)],
        );
        let def = IndexDefinition::from_config(&compound);
        assert_eq!(def.key_spec(), "{A: 1, B: -1}");
    }

    #[tokio::test]
    async fn create_is_idempotent_and_detects_conflicts() {
        let backend = InMemoryIndexBackend::new();
        let def = IndexDefinition::new("idx_status", [("Status", IndexKey::Ascending)]);

        assert_eq!(backend.create_index("c", &def).await.unwrap(), CreateOutcome::Created);
        assert_eq!(backend.create_index("c", &def).await.unwrap(), CreateOutcome::AlreadyExists);
        assert_eq!(backend.build_count("c", "idx_status"), 1);

        let other = IndexDefinition::new("idx_status", [("Status", IndexKey::Descending)]);
        let err = backend.create_index("c", &other).await.unwrap_err();
        assert!(matches!(err, IndexError::Conflict { .. }));
        assert_eq!(err.kind(), FailureKind::Configuration);
    }

    #[tokio::test]
    async fn drop_and_list() {
        let backend = InMemoryIndexBackend::new();
        let def = IndexDefinition::new("idx_a", [("A", IndexKey::Ascending)]);
        backend.create_index("c", &def).await.unwrap();
        assert_eq!(backend.list_indexes("c").await.unwrap().len(), 1);
        assert!(backend.drop_index("c", "idx_a").await.unwrap());
        assert!(!backend.drop_index("c", "idx_a").await.unwrap());
        assert!(backend.list_indexes("c").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_definitions_are_rejected() {
        let backend = InMemoryIndexBackend::new();
        let def = IndexDefinition::new("idx_none", Vec::<(String, IndexKey)>::new());
        assert!(matches!(
            backend.create_index("c", &def).await,
            Err(IndexError::InvalidDefinition(_))
        ));
    }
}
