//! Read path that reports its executions to the optimizer.

use std::sync::Arc;
use std::time::Instant;

use smartproj_core::TenantId;

use super::optimizer::QueryPatternOptimizer;
use super::pattern::ExecutedQuery;
use crate::projection::{FindQuery, FindResult, ReadStore, ReadStoreError, collection_name};

/// Runs projection queries and feeds each execution to the optimizer.
#[derive(Clone)]
pub struct TrackedQueries {
    store: Arc<dyn ReadStore>,
    optimizer: QueryPatternOptimizer,
}

impl core::fmt::Debug for TrackedQueries {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TrackedQueries").finish_non_exhaustive()
    }
}

impl TrackedQueries {
    pub fn new(store: Arc<dyn ReadStore>, optimizer: QueryPatternOptimizer) -> Self {
        Self { store, optimizer }
    }

    pub async fn find(
        &self,
        tenant_id: TenantId,
        aggregate_type: &str,
        query: FindQuery,
    ) -> Result<FindResult, ReadStoreError> {
        let started = Instant::now();
        let result = self
            .store
            .find(&collection_name(aggregate_type), tenant_id, &query)
            .await?;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        self.optimizer.observe_detached(ExecutedQuery {
            tenant_id,
            aggregate_type: aggregate_type.to_string(),
            filter: query.filter,
            sort: query.sort,
            execution_time_ms: elapsed_ms,
            docs_examined: result.docs_examined,
            docs_returned: result.documents.len() as u64,
        });
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::indexes::{InMemoryIndexBackend, IndexManager};
    use crate::projection::{AggregateDescriptor, AggregateRegistry, InMemoryAggregateSource, InMemoryReadStore};
    use crate::query_patterns::OptimizerConfig;
    use crate::smart_config::{
        ConfigCacheConfig, ConfigOverride, InMemoryOverrideSource, ObjectCategory, SmartProjectionService,
        TrackingOverride,
    };

    #[tokio::test]
    async fn executions_are_reported_with_their_statistics() {
        let overrides = Arc::new(InMemoryOverrideSource::new());
        overrides.set_object_override(
            "SalesOrder",
            ConfigOverride {
                query_pattern_tracking: Some(TrackingOverride {
                    sample_rate: Some(1.0),
                    ..TrackingOverride::default()
                }),
                ..ConfigOverride::default()
            },
        );
        let registry = AggregateRegistry::new().with(AggregateDescriptor::new(
            "SalesOrder",
            ObjectCategory::Transaction,
            Arc::new(InMemoryAggregateSource::new()),
        ));
        let configs = Arc::new(SmartProjectionService::new(overrides.clone(), ConfigCacheConfig::default()));
        let optimizer = QueryPatternOptimizer::new(
            OptimizerConfig::default(),
            IndexManager::new(Arc::new(InMemoryIndexBackend::new())),
            configs.clone(),
            Arc::new(registry),
        );
        let tracked = TrackedQueries::new(Arc::new(InMemoryReadStore::new()), optimizer.clone());
        let tenant = TenantId::new();

        // cold cache: the resolve happens off the query path
        let result = tracked
            .find(tenant, "SalesOrder", FindQuery::new(json!({"Status": "Open"})))
            .await
            .unwrap();
        assert!(result.documents.is_empty());
        let folded = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                optimizer.fold_pending();
                if !optimizer.patterns("Entity_SalesOrder").is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(folded.is_ok(), "sample never folded");
        assert!(configs.peek(tenant, "SalesOrder").is_some());

        // warm cache: sampled inline, the override source is not consulted again
        overrides.set_object_override(
            "SalesOrder",
            ConfigOverride {
                query_pattern_tracking: Some(TrackingOverride {
                    sample_rate: Some(0.0),
                    ..TrackingOverride::default()
                }),
                ..ConfigOverride::default()
            },
        );
        tracked
            .find(tenant, "SalesOrder", FindQuery::new(json!({"Status": "Open"})))
            .await
            .unwrap();
        optimizer.fold_pending();

        let patterns = optimizer.patterns("Entity_SalesOrder");
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].filter_fields, vec!["Status"]);
        assert_eq!(patterns[0].execution_count, 2);
        assert_eq!(optimizer.stats().sampled, 2);
    }
}
