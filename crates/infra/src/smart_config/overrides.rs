//! Partial configuration layers and where they come from.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use smartproj_core::TenantId;

use super::types::{
    AggregationPipelineConfig, ArchivalConfig, CachingConfig, CompressionConfig, DenormalizationConfig,
    IndexConfig, ShardingConfig, SmartConfigError, SmartProjectionConfig, ValidationConfig,
};

/// Field-by-field override of [`super::QueryPatternTrackingConfig`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct TrackingOverride {
    pub enabled: Option<bool>,
    pub sample_rate: Option<f64>,
    pub min_execution_count: Option<u64>,
    pub analysis_window_hours: Option<u32>,
    pub auto_create_indexes: Option<bool>,
    pub max_auto_indexes_per_run: Option<usize>,
    pub include_sort_fields: Option<bool>,
}

/// A partial configuration layered over the category defaults.
///
/// Scalars and knob sections replace; indexes merge by name. A default index
/// only disappears when it is listed in `disabled_indexes`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ConfigOverride {
    pub auto_optimize: Option<bool>,
    /// Added, or replacing a same-named index.
    pub indexes: Vec<IndexConfig>,
    pub disabled_indexes: Vec<String>,
    /// Appended; an entry with the same source field and target type replaces the earlier one.
    pub denormalizations: Vec<DenormalizationConfig>,
    pub ttl_days: Option<u32>,
    /// Removes an inherited TTL. Wins over `ttl_days`.
    pub disable_ttl: bool,
    pub sharding: Option<ShardingConfig>,
    pub caching: Option<CachingConfig>,
    pub aggregation_pipelines: Option<Vec<AggregationPipelineConfig>>,
    pub validation: Option<ValidationConfig>,
    pub archival: Option<ArchivalConfig>,
    pub compression: Option<CompressionConfig>,
    pub query_pattern_tracking: Option<TrackingOverride>,
}

impl ConfigOverride {
    /// Fields set on this layer that shape the collection itself. Indexes and
    /// expiry are built once per collection, so only the object layer may set them.
    pub fn collection_wide_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if !self.indexes.is_empty() {
            fields.push("Indexes");
        }
        if !self.disabled_indexes.is_empty() {
            fields.push("DisabledIndexes");
        }
        if self.ttl_days.is_some() {
            fields.push("TtlDays");
        }
        if self.disable_ttl {
            fields.push("DisableTtl");
        }
        fields
    }

    pub fn apply_to(&self, config: &mut SmartProjectionConfig) {
        if let Some(auto) = self.auto_optimize {
            config.auto_optimize = auto;
        }

        for index in &self.indexes {
            match config.indexes.iter_mut().find(|i| i.name == index.name) {
                Some(existing) => *existing = index.clone(),
                None => config.indexes.push(index.clone()),
            }
        }
        if !self.disabled_indexes.is_empty() {
            config
                .indexes
                .retain(|i| !self.disabled_indexes.iter().any(|d| d == &i.name));
        }

        for denorm in &self.denormalizations {
            match config.denormalizations.iter_mut().find(|d| {
                d.source_field == denorm.source_field && d.target_aggregate_type == denorm.target_aggregate_type
            }) {
                Some(existing) => *existing = denorm.clone(),
                None => config.denormalizations.push(denorm.clone()),
            }
        }

        if let Some(days) = self.ttl_days {
            config.ttl_days = Some(days);
        }
        if self.disable_ttl {
            config.ttl_days = None;
        }

        if let Some(sharding) = &self.sharding {
            config.sharding = sharding.clone();
        }
        if let Some(caching) = &self.caching {
            config.caching = caching.clone();
        }
        if let Some(pipelines) = &self.aggregation_pipelines {
            config.aggregation_pipelines = pipelines.clone();
        }
        if let Some(validation) = &self.validation {
            config.validation = validation.clone();
        }
        if let Some(archival) = &self.archival {
            config.archival = archival.clone();
        }
        if let Some(compression) = &self.compression {
            config.compression = compression.clone();
        }

        if let Some(tracking) = &self.query_pattern_tracking {
            let target = &mut config.query_pattern_tracking;
            if let Some(v) = tracking.enabled {
                target.enabled = v;
            }
            if let Some(v) = tracking.sample_rate {
                target.sample_rate = v;
            }
            if let Some(v) = tracking.min_execution_count {
                target.min_execution_count = v;
            }
            if let Some(v) = tracking.analysis_window_hours {
                target.analysis_window_hours = v;
            }
            if let Some(v) = tracking.auto_create_indexes {
                target.auto_create_indexes = v;
            }
            if let Some(v) = tracking.max_auto_indexes_per_run {
                target.max_auto_indexes_per_run = v;
            }
            if let Some(v) = tracking.include_sort_fields {
                target.include_sort_fields = v;
            }
        }
    }
}

/// Where overrides are stored (config table, file, admin API...).
#[async_trait]
pub trait OverrideSource: Send + Sync {
    /// Override for an object type across all tenants.
    async fn object_override(&self, object_type: &str) -> Result<Option<ConfigOverride>, SmartConfigError>;

    /// Override for one tenant's view of an object type.
    async fn tenant_override(
        &self,
        tenant_id: TenantId,
        object_type: &str,
    ) -> Result<Option<ConfigOverride>, SmartConfigError>;
}

/// Source with no overrides at all: everything resolves to defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOverrides;

#[async_trait]
impl OverrideSource for NoOverrides {
    async fn object_override(&self, _object_type: &str) -> Result<Option<ConfigOverride>, SmartConfigError> {
        Ok(None)
    }

    async fn tenant_override(
        &self,
        _tenant_id: TenantId,
        _object_type: &str,
    ) -> Result<Option<ConfigOverride>, SmartConfigError> {
        Ok(None)
    }
}

/// In-memory override table for tests/dev and embedded use.
#[derive(Debug, Default)]
pub struct InMemoryOverrideSource {
    objects: RwLock<HashMap<String, ConfigOverride>>,
    tenants: RwLock<HashMap<(TenantId, String), ConfigOverride>>,
}

impl InMemoryOverrideSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_object_override(&self, object_type: impl Into<String>, layer: ConfigOverride) {
        if let Ok(mut objects) = self.objects.write() {
            objects.insert(object_type.into(), layer);
        }
    }

    pub fn set_tenant_override(&self, tenant_id: TenantId, object_type: impl Into<String>, layer: ConfigOverride) {
        if let Ok(mut tenants) = self.tenants.write() {
            tenants.insert((tenant_id, object_type.into()), layer);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut objects) = self.objects.write() {
            objects.clear();
        }
        if let Ok(mut tenants) = self.tenants.write() {
            tenants.clear();
        }
    }
}

fn poisoned() -> SmartConfigError {
    SmartConfigError::Source("override table lock poisoned".to_string())
}

#[async_trait]
impl OverrideSource for InMemoryOverrideSource {
    async fn object_override(&self, object_type: &str) -> Result<Option<ConfigOverride>, SmartConfigError> {
        Ok(self.objects.read().map_err(|_| poisoned())?.get(object_type).cloned())
    }

    async fn tenant_override(
        &self,
        tenant_id: TenantId,
        object_type: &str,
    ) -> Result<Option<ConfigOverride>, SmartConfigError> {
        Ok(self
            .tenants
            .read()
            .map_err(|_| poisoned())?
            .get(&(tenant_id, object_type.to_string()))
            .cloned())
    }
}
