//! Index management for projection collections.

pub mod backend;
pub mod manager;
pub mod postgres;

pub use backend::{CreateOutcome, InMemoryIndexBackend, IndexBackend, IndexDefinition, IndexError, IndexKey};
pub use manager::{
    EnsureReport, IDX_PROJECTED_AT, IDX_TENANT_ID, IDX_TENANT_PROJECTED_AT, IDX_TTL, IndexInfo, IndexManager,
    IndexSuggestion, baseline_indexes, estimated_impact, ttl_index,
};
pub use postgres::{INDEX_CATALOG_SCHEMA, PostgresIndexBackend};
