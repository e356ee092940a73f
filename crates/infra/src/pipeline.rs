//! Wires the outbox publisher, the event consumer and the query pattern
//! optimizer into one running pipeline.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use smartproj_core::FailureKind;
use smartproj_events::MessageBus;

use crate::cancel::Cancellation;
use crate::config::{ConfigError, PipelineConfig};
use crate::consumer::{ConsumerError, ConsumerHandle, ConsumerStats, EventConsumer};
use crate::indexes::{EnsureReport, IndexError, IndexManager};
use crate::outbox::{OutboxPublisher, OutboxStore, PublisherHandle, PublisherStats};
use crate::projection::{AggregateRegistry, ExtensionFieldSource, ProjectionManager, ReadStore};
use crate::query_patterns::{OptimizerHandle, OptimizerStats, QueryPatternOptimizer, TrackedQueries};
use crate::smart_config::{SmartConfigError, SmartProjectionService};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    SmartConfig(#[from] SmartConfigError),
    #[error("failed to ensure indexes on {collection}: {source}")]
    Indexes {
        collection: String,
        #[source]
        source: IndexError,
    },
    #[error(transparent)]
    Consumer(#[from] ConsumerError),
}

impl PipelineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PipelineError::Config(e) => e.kind(),
            PipelineError::SmartConfig(e) => e.kind(),
            PipelineError::Indexes { source, .. } => source.kind(),
            PipelineError::Consumer(e) => e.kind(),
        }
    }
}

/// Adapters the pipeline runs on.
pub struct PipelineParts {
    pub outbox: Arc<dyn OutboxStore>,
    pub bus: Arc<dyn MessageBus>,
    pub registry: Arc<AggregateRegistry>,
    pub read_store: Arc<dyn ReadStore>,
    pub configs: Arc<SmartProjectionService>,
    pub indexes: IndexManager,
    pub extensions: Option<Arc<dyn ExtensionFieldSource>>,
}

pub struct Pipeline;

impl Pipeline {
    /// Ensure every registered collection's indexes, then start the workers.
    ///
    /// The consumer is subscribed before this returns.
    pub async fn start(parts: PipelineParts, config: &PipelineConfig) -> Result<PipelineHandle, PipelineError> {
        config.validate()?;

        let mut ensured = Vec::new();
        for descriptor in parts.registry.descriptors() {
            let collection = descriptor.collection();
            let resolved = parts
                .configs
                .resolve_object_type(&descriptor.aggregate_type, descriptor.category)
                .await?;
            let report = parts
                .indexes
                .ensure_indexes(&collection, Some(resolved.as_ref()), &Cancellation::never())
                .await
                .map_err(|source| PipelineError::Indexes {
                    collection: collection.clone(),
                    source,
                })?;
            info!(
                collection = %collection,
                created = report.created.len(),
                already_present = report.already_present.len(),
                "indexes ensured"
            );
            ensured.push((collection, report));
        }

        let mut manager = ProjectionManager::new(parts.registry.clone(), parts.read_store.clone(), parts.configs.clone());
        if let Some(extensions) = parts.extensions {
            manager = manager.with_extensions(extensions);
        }
        let manager = Arc::new(manager);

        let consumer = EventConsumer::new(parts.bus.clone(), manager.clone(), config.consumer.clone())
            .start()
            .await?;
        let publisher = OutboxPublisher::new(parts.outbox, parts.bus, config.publisher.clone()).spawn();

        let optimizer = QueryPatternOptimizer::new(
            config.optimizer.clone(),
            parts.indexes.clone(),
            parts.configs.clone(),
            parts.registry.clone(),
        );
        let optimizer_worker = config.optimizer.enabled.then(|| optimizer.spawn());
        let queries = TrackedQueries::new(parts.read_store, optimizer.clone());

        info!(
            collections = ensured.len(),
            optimizer = config.optimizer.enabled,
            "projection pipeline started"
        );
        Ok(PipelineHandle {
            publisher,
            consumer,
            optimizer_worker,
            optimizer,
            queries,
            manager,
            ensured,
        })
    }
}

/// Running pipeline.
pub struct PipelineHandle {
    publisher: PublisherHandle,
    consumer: ConsumerHandle,
    optimizer_worker: Option<OptimizerHandle>,
    optimizer: QueryPatternOptimizer,
    queries: TrackedQueries,
    manager: Arc<ProjectionManager>,
    ensured: Vec<(String, EnsureReport)>,
}

impl core::fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PipelineHandle").finish_non_exhaustive()
    }
}

impl PipelineHandle {
    /// Read path whose executions feed the optimizer.
    pub fn queries(&self) -> &TrackedQueries {
        &self.queries
    }

    pub fn optimizer(&self) -> &QueryPatternOptimizer {
        &self.optimizer
    }

    pub fn projections(&self) -> &Arc<ProjectionManager> {
        &self.manager
    }

    /// Startup index reports per collection.
    pub fn ensured_indexes(&self) -> &[(String, EnsureReport)] {
        &self.ensured
    }

    pub fn publisher_stats(&self) -> PublisherStats {
        self.publisher.stats()
    }

    pub fn consumer_stats(&self) -> ConsumerStats {
        self.consumer.stats()
    }

    pub fn optimizer_stats(&self) -> OptimizerStats {
        self.optimizer.stats()
    }

    /// Publisher first (finishes its batch), then the consumer (drains its
    /// queues), then the optimizer.
    pub async fn shutdown(self) {
        self.publisher.shutdown().await;
        self.consumer.shutdown().await;
        if let Some(worker) = self.optimizer_worker {
            worker.shutdown().await;
        }
        info!("projection pipeline stopped");
    }
}
