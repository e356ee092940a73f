//! Aggregate types known to the projection pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use super::collaborators::AggregateSource;
use crate::smart_config::ObjectCategory;

/// Prefix of every projection collection.
pub const COLLECTION_PREFIX: &str = "Entity_";

/// `Entity_<AggregateType>`.
pub fn collection_name(aggregate_type: &str) -> String {
    format!("{COLLECTION_PREFIX}{aggregate_type}")
}

/// How the write model stores an aggregate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StorageModel {
    /// Fixed columns only.
    #[default]
    Relational,
    /// Fixed columns plus tenant-defined extension fields.
    Hybrid,
}

#[derive(Clone)]
pub struct AggregateDescriptor {
    pub aggregate_type: String,
    pub category: ObjectCategory,
    pub storage: StorageModel,
    pub source: Arc<dyn AggregateSource>,
}

impl core::fmt::Debug for AggregateDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AggregateDescriptor")
            .field("aggregate_type", &self.aggregate_type)
            .field("category", &self.category)
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}

impl AggregateDescriptor {
    pub fn new(aggregate_type: impl Into<String>, category: ObjectCategory, source: Arc<dyn AggregateSource>) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            category,
            storage: StorageModel::Relational,
            source,
        }
    }

    pub fn hybrid(mut self) -> Self {
        self.storage = StorageModel::Hybrid;
        self
    }

    pub fn collection(&self) -> String {
        collection_name(&self.aggregate_type)
    }
}

/// Registry of projectable aggregate types, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct AggregateRegistry {
    by_type: HashMap<String, AggregateDescriptor>,
}

impl AggregateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a descriptor.
    pub fn register(&mut self, descriptor: AggregateDescriptor) -> &mut Self {
        self.by_type.insert(descriptor.aggregate_type.clone(), descriptor);
        self
    }

    pub fn with(mut self, descriptor: AggregateDescriptor) -> Self {
        self.register(descriptor);
        self
    }

    pub fn get(&self, aggregate_type: &str) -> Option<&AggregateDescriptor> {
        self.by_type.get(aggregate_type)
    }

    pub fn category_of(&self, aggregate_type: &str) -> Option<ObjectCategory> {
        self.get(aggregate_type).map(|d| d.category)
    }

    /// Resolve the aggregate type stored in `collection` (`Entity_<Type>`).
    pub fn for_collection(&self, collection: &str) -> Option<&AggregateDescriptor> {
        collection
            .strip_prefix(COLLECTION_PREFIX)
            .and_then(|aggregate_type| self.get(aggregate_type))
    }

    /// Registered types, sorted.
    pub fn aggregate_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.by_type.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &AggregateDescriptor> {
        self.by_type.values()
    }

    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}
