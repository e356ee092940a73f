//! Transactional outbox: storage, transaction-bound enqueue and the publisher.

pub mod postgres;
pub mod publisher;
pub mod store;
pub mod types;

pub use postgres::{OUTBOX_SCHEMA, PgOutboxWriter, PostgresOutboxStore};
pub use publisher::{BatchReport, OutboxPublisher, PublisherConfig, PublisherHandle, PublisherStats};
pub use store::{InMemoryOutboxStore, InMemoryOutboxTx, OutboxStore, OutboxWriter};
pub use types::{OutboxError, OutboxMessage, OutboxStats, OutboxStatus};
