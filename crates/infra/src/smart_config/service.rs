//! Injected, cached resolver of effective projection configuration.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use smartproj_core::TenantId;

use super::defaults::default_config_for;
use super::overrides::OverrideSource;
use super::types::{ObjectCategory, SmartConfigError, SmartProjectionConfig};
use crate::retry::duration_ms;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigCacheConfig {
    /// How long a resolved config is reused. Zero disables caching.
    #[serde(with = "duration_ms")]
    pub ttl: Duration,
}

impl Default for ConfigCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConfigCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// `None` tenant = object-level resolution (no tenant layer).
type CacheKey = (Option<TenantId>, String);

struct CachedConfig {
    config: Arc<SmartProjectionConfig>,
    loaded_at: Instant,
}

/// Resolves `defaults(category) <- object override <- tenant override`.
///
/// Results are cached per `(tenant, object type)` for the configured TTL.
/// Callers that change overrides invalidate explicitly; the TTL bounds how
/// long any other change can go unnoticed.
pub struct SmartProjectionService {
    source: Arc<dyn OverrideSource>,
    cache_config: ConfigCacheConfig,
    cache: RwLock<HashMap<CacheKey, CachedConfig>>,
    stats: RwLock<ConfigCacheStats>,
}

impl core::fmt::Debug for SmartProjectionService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SmartProjectionService")
            .field("cache_config", &self.cache_config)
            .finish_non_exhaustive()
    }
}

impl SmartProjectionService {
    pub fn new(source: Arc<dyn OverrideSource>, cache_config: ConfigCacheConfig) -> Self {
        Self {
            source,
            cache_config,
            cache: RwLock::new(HashMap::new()),
            stats: RwLock::new(ConfigCacheStats::default()),
        }
    }

    /// Deterministic baseline for a category (no overrides applied).
    pub fn get_default_config(&self, category: ObjectCategory) -> SmartProjectionConfig {
        super::defaults::get_default_config(category)
    }

    /// Effective configuration of `object_type` for `tenant_id`.
    pub async fn resolve(
        &self,
        tenant_id: TenantId,
        object_type: &str,
        category: ObjectCategory,
    ) -> Result<Arc<SmartProjectionConfig>, SmartConfigError> {
        self.resolve_layers(Some(tenant_id), object_type, category).await
    }

    /// Configuration shared by all tenants: defaults plus the object-level override.
    ///
    /// Collection-wide concerns (indexes, pattern analysis) use this one.
    pub async fn resolve_object_type(
        &self,
        object_type: &str,
        category: ObjectCategory,
    ) -> Result<Arc<SmartProjectionConfig>, SmartConfigError> {
        self.resolve_layers(None, object_type, category).await
    }

    async fn resolve_layers(
        &self,
        tenant_id: Option<TenantId>,
        object_type: &str,
        category: ObjectCategory,
    ) -> Result<Arc<SmartProjectionConfig>, SmartConfigError> {
        let key = (tenant_id, object_type.to_string());

        if let Some(hit) = self.cached(&key) {
            self.bump(|s| s.hits += 1);
            return Ok(hit);
        }
        self.bump(|s| s.misses += 1);

        let mut config = default_config_for(object_type, category);
        if let Some(layer) = self.source.object_override(object_type).await? {
            layer.apply_to(&mut config);
        }
        if let Some(tenant_id) = tenant_id {
            if let Some(layer) = self.source.tenant_override(tenant_id, object_type).await? {
                let rejected = layer.collection_wide_fields();
                if !rejected.is_empty() {
                    return Err(SmartConfigError::Invalid {
                        object_type: object_type.to_string(),
                        reason: format!(
                            "tenant override of {tenant_id} sets {}; only the object override may",
                            rejected.join(", ")
                        ),
                    });
                }
                layer.apply_to(&mut config);
            }
        }
        config.validate()?;

        let config = Arc::new(config);
        if !self.cache_config.ttl.is_zero() {
            if let Ok(mut cache) = self.cache.write() {
                cache.insert(
                    key,
                    CachedConfig {
                        config: config.clone(),
                        loaded_at: Instant::now(),
                    },
                );
            }
        }
        debug!(tenant_id = ?tenant_id, object_type, "resolved projection config");
        Ok(config)
    }

    /// Fresh cached config of `object_type` for `tenant_id`. Never reads the
    /// override source.
    pub fn peek(&self, tenant_id: TenantId, object_type: &str) -> Option<Arc<SmartProjectionConfig>> {
        self.cached(&(Some(tenant_id), object_type.to_string()))
    }

    fn cached(&self, key: &CacheKey) -> Option<Arc<SmartProjectionConfig>> {
        let cache = self.cache.read().ok()?;
        let entry = cache.get(key)?;
        (entry.loaded_at.elapsed() < self.cache_config.ttl).then(|| entry.config.clone())
    }

    fn bump(&self, f: impl FnOnce(&mut ConfigCacheStats)) {
        if let Ok(mut stats) = self.stats.write() {
            f(&mut stats);
        }
    }

    /// Drop the cached config of one object type for one tenant.
    pub fn invalidate(&self, tenant_id: TenantId, object_type: &str) {
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(&(Some(tenant_id), object_type.to_string()));
        }
    }

    /// Drop every cached config of a tenant.
    pub fn invalidate_tenant(&self, tenant_id: TenantId) {
        if let Ok(mut cache) = self.cache.write() {
            cache.retain(|(tenant, _), _| *tenant != Some(tenant_id));
        }
    }

    /// Drop cached configs of an object type for every tenant (object-level override changed).
    pub fn invalidate_object_type(&self, object_type: &str) {
        if let Ok(mut cache) = self.cache.write() {
            cache.retain(|(_, ty), _| ty != object_type);
        }
    }

    pub fn invalidate_all(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
    }

    pub fn cache_stats(&self) -> ConfigCacheStats {
        let mut stats = self.stats.read().map(|s| *s).unwrap_or_default();
        stats.entries = self.cache.read().map(|c| c.len()).unwrap_or_default();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smart_config::defaults::{IDX_IS_ACTIVE, IDX_STATUS_DATE};
    use crate::smart_config::overrides::{ConfigOverride, InMemoryOverrideSource};
    use crate::smart_config::types::IndexConfig;

    fn service(source: Arc<InMemoryOverrideSource>, ttl: Duration) -> SmartProjectionService {
        SmartProjectionService::new(source, ConfigCacheConfig { ttl })
    }

    #[tokio::test]
    async fn tenant_layer_wins_over_object_layer() {
        let source = Arc::new(InMemoryOverrideSource::new());
        let tenant = TenantId::new();
        source.set_object_override(
            "SalesOrder",
            ConfigOverride {
                ttl_days: Some(90),
                auto_optimize: Some(false),
                indexes: vec![IndexConfig::single("idx_customer", "CustomerId")],
                ..Default::default()
            },
        );
        source.set_tenant_override(
            tenant,
            "SalesOrder",
            ConfigOverride {
                auto_optimize: Some(true),
                ..Default::default()
            },
        );
        let svc = service(source, Duration::from_secs(60));

        let cfg = svc.resolve(tenant, "SalesOrder", ObjectCategory::Transaction).await.unwrap();
        assert!(cfg.auto_optimize);
        assert_eq!(cfg.ttl_days, Some(90));
        assert!(cfg.index("idx_customer").is_some());
        assert!(cfg.index(IDX_STATUS_DATE).is_some());

        let other = svc
            .resolve(TenantId::new(), "SalesOrder", ObjectCategory::Transaction)
            .await
            .unwrap();
        assert!(!other.auto_optimize);

        let shared = svc.resolve_object_type("SalesOrder", ObjectCategory::Transaction).await.unwrap();
        assert!(!shared.auto_optimize);
        assert_eq!(shared.ttl_days, Some(90));
    }

    #[tokio::test]
    async fn tenant_layer_cannot_change_indexes_or_expiry() {
        let source = Arc::new(InMemoryOverrideSource::new());
        let tenant = TenantId::new();
        source.set_tenant_override(
            tenant,
            "SalesOrder",
            ConfigOverride {
                ttl_days: Some(30),
                indexes: vec![IndexConfig::single("idx_tenant_custom", "CustomerId")],
                ..Default::default()
            },
        );
        let svc = service(source.clone(), Duration::ZERO);

        let err = svc
            .resolve(tenant, "SalesOrder", ObjectCategory::Transaction)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), smartproj_core::FailureKind::Configuration);
        let message = err.to_string();
        assert!(message.contains("Indexes") && message.contains("TtlDays"), "{message}");

        for layer in [
            ConfigOverride {
                disabled_indexes: vec![IDX_STATUS_DATE.to_string()],
                ..Default::default()
            },
            ConfigOverride {
                disable_ttl: true,
                ..Default::default()
            },
        ] {
            source.set_tenant_override(tenant, "SalesOrder", layer);
            assert!(svc.resolve(tenant, "SalesOrder", ObjectCategory::Transaction).await.is_err());
        }

        // other tenants and the collection-wide view are unaffected
        assert!(svc.resolve(TenantId::new(), "SalesOrder", ObjectCategory::Transaction).await.is_ok());
        assert!(svc.resolve_object_type("SalesOrder", ObjectCategory::Transaction).await.is_ok());
    }

    #[tokio::test]
    async fn cache_serves_until_invalidated() {
        let source = Arc::new(InMemoryOverrideSource::new());
        let tenant = TenantId::new();
        let svc = service(source.clone(), Duration::from_secs(60));

        let first = svc.resolve(tenant, "Customer", ObjectCategory::Master).await.unwrap();
        assert!(first.index(IDX_IS_ACTIVE).is_some());

        source.set_object_override(
            "Customer",
            ConfigOverride {
                disabled_indexes: vec![IDX_IS_ACTIVE.to_string()],
                ..Default::default()
            },
        );
        let cached = svc.resolve(tenant, "Customer", ObjectCategory::Master).await.unwrap();
        assert!(Arc::ptr_eq(&first, &cached));

        svc.invalidate(tenant, "Customer");
        let fresh = svc.resolve(tenant, "Customer", ObjectCategory::Master).await.unwrap();
        assert!(fresh.index(IDX_IS_ACTIVE).is_none());

        let stats = svc.cache_stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 2, 1));
    }

    #[tokio::test]
    async fn zero_ttl_disables_caching() {
        let svc = service(Arc::new(InMemoryOverrideSource::new()), Duration::ZERO);
        let tenant = TenantId::new();
        svc.resolve(tenant, "Customer", ObjectCategory::Master).await.unwrap();
        svc.resolve(tenant, "Customer", ObjectCategory::Master).await.unwrap();
        assert_eq!(svc.cache_stats().misses, 2);
        assert_eq!(svc.cache_stats().entries, 0);
    }

    #[tokio::test]
    async fn invalid_override_is_a_configuration_error() {
        let source = Arc::new(InMemoryOverrideSource::new());
        source.set_object_override(
            "SalesOrder",
            ConfigOverride {
                ttl_days: Some(0),
                ..Default::default()
            },
        );
        let svc = service(source, Duration::from_secs(60));
        let err = svc
            .resolve(TenantId::new(), "SalesOrder", ObjectCategory::Transaction)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), smartproj_core::FailureKind::Configuration);
    }

    #[tokio::test]
    async fn invalidation_is_scoped() {
        let svc = service(Arc::new(InMemoryOverrideSource::new()), Duration::from_secs(60));
        let (a, b) = (TenantId::new(), TenantId::new());
        svc.resolve(a, "X", ObjectCategory::Master).await.unwrap();
        svc.resolve(b, "X", ObjectCategory::Master).await.unwrap();

        svc.invalidate_tenant(a);
        assert_eq!(svc.cache_stats().entries, 1);
        svc.resolve(a, "Y", ObjectCategory::Master).await.unwrap();
        svc.invalidate_object_type("X");
        assert!(svc.peek(b, "X").is_none());
        assert!(svc.peek(a, "Y").is_some());
        svc.invalidate_all();
        assert_eq!(svc.cache_stats().entries, 0);
    }
}
