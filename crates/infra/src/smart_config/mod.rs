//! Smart projection configuration: category defaults, overrides and the resolver.

pub mod defaults;
pub mod overrides;
pub mod service;
pub mod types;

pub use defaults::{IDX_CODE, IDX_IS_ACTIVE, IDX_STATUS_DATE, default_config_for, get_default_config};
pub use overrides::{ConfigOverride, InMemoryOverrideSource, NoOverrides, OverrideSource, TrackingOverride};
pub use service::{ConfigCacheConfig, ConfigCacheStats, SmartProjectionService};
pub use types::{
    AggregationPipelineConfig, ArchivalConfig, CachingConfig, Collation, CompressionAlgorithm, CompressionConfig,
    DenormalizationConfig, IndexConfig, IndexOrigin, IndexType, IndexUsageStats, ObjectCategory,
    QueryPatternTrackingConfig, ShardingConfig, SmartConfigError, SmartProjectionConfig, SortDirection,
    ValidationConfig,
};
