//! Built-in per-category defaults.

use super::types::{
    ArchivalConfig, CachingConfig, CompressionConfig, IndexConfig, IndexOrigin, IndexType, ObjectCategory,
    QueryPatternTrackingConfig, ShardingConfig, SmartProjectionConfig, SortDirection, ValidationConfig,
};

pub const IDX_STATUS_DATE: &str = "idx_status_date";
pub const IDX_IS_ACTIVE: &str = "idx_is_active";
pub const IDX_CODE: &str = "idx_code";

/// Deterministic baseline for a category.
///
/// - `Transaction`: compound `idx_status_date` over `(Status, DocumentDate)`, `idx_is_active`
/// - `Master`: unique `idx_code`, `idx_is_active`
///
/// Query-pattern tracking is on with a 10% sample rate and a minimum of 100
/// executions before a pattern can yield an index; auto-creation is off.
pub fn get_default_config(category: ObjectCategory) -> SmartProjectionConfig {
    default_config_for("", category)
}

/// [`get_default_config`] stamped with the object type it will describe.
pub fn default_config_for(object_type: &str, category: ObjectCategory) -> SmartProjectionConfig {
    let is_active = IndexConfig::single(IDX_IS_ACTIVE, "IsActive").with_origin(IndexOrigin::System);

    let indexes = match category {
        ObjectCategory::Transaction => vec![
            IndexConfig::new(
                IDX_STATUS_DATE,
                [("Status", SortDirection::Ascending), ("DocumentDate", SortDirection::Descending)],
            )
            .with_type(IndexType::Compound)
            .with_origin(IndexOrigin::System),
            is_active,
        ],
        ObjectCategory::Master => vec![
            IndexConfig::single(IDX_CODE, "Code")
                .unique()
                .with_origin(IndexOrigin::System),
            is_active,
        ],
    };

    SmartProjectionConfig {
        object_type: object_type.to_string(),
        category,
        auto_optimize: true,
        indexes,
        denormalizations: Vec::new(),
        ttl_days: None,
        sharding: ShardingConfig::default(),
        caching: CachingConfig {
            enabled: category == ObjectCategory::Master,
            ttl_seconds: 300,
        },
        aggregation_pipelines: Vec::new(),
        validation: ValidationConfig::default(),
        archival: ArchivalConfig::default(),
        compression: CompressionConfig::default(),
        query_pattern_tracking: QueryPatternTrackingConfig::default(),
    }
}
