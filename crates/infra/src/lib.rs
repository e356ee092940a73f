//! Infrastructure layer of the projection pipeline: outbox, bus consumers,
//! projections, smart configuration, index management and query-pattern
//! optimization, with in-memory and Postgres/Redis adapters.

pub mod cancel;
pub mod config;
pub mod consumer;
pub mod event_bus;
pub mod indexes;
pub mod outbox;
pub mod pipeline;
pub mod projection;
pub mod query_patterns;
pub mod retry;
pub mod smart_config;
pub mod workers;

pub(crate) mod pg;


pub use cancel::{Cancellation, CancellationSource, Cancelled};
pub use config::{ConfigError, PipelineConfig};
pub use consumer::{ConsumerConfig, ConsumerError, ConsumerHandle, ConsumerStats, EventConsumer};
pub use pipeline::{Pipeline, PipelineError, PipelineHandle, PipelineParts};
