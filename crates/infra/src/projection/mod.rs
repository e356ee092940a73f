//! Idempotent projection of write-model aggregates into the read store.

pub mod collaborators;
pub mod filter;
pub mod manager;
pub mod postgres;
pub mod read_store;
pub mod registry;

pub use collaborators::{
    AggregateSource, AggregateState, CollaboratorError, ExtensionFieldSource, InMemoryAggregateSource,
    InMemoryExtensionFields, NoExtensionFields,
};
pub use manager::{ProjectionError, ProjectionManager, ProjectionOutcome, SkipReason};
pub use postgres::{PostgresReadStore, READ_STORE_SCHEMA};
pub use read_store::{
    ConsumedEventRecord, FIELD_AGGREGATE_TYPE, FIELD_ID, FIELD_PROJECTED_AT, FIELD_TENANT_ID, FIELD_VERSION,
    FindQuery, FindResult, InMemoryReadStore, ProjectionDocument, ReadStore, ReadStoreError, SYSTEM_FIELDS,
    UpsertOutcome,
};
pub use registry::{AggregateDescriptor, AggregateRegistry, COLLECTION_PREFIX, StorageModel, collection_name};
