//! Smart projection configuration model.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use smartproj_core::FailureKind;

/// Built-in default family of an aggregate type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectCategory {
    /// Documents with a lifecycle (orders, invoices, payroll runs).
    Transaction,
    /// Reference data (customers, items, accounts).
    Master,
}

impl ObjectCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectCategory::Transaction => "Transaction",
            ObjectCategory::Master => "Master",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "transaction" => Some(Self::Transaction),
            "master" => Some(Self::Master),
            _ => None,
        }
    }
}

impl core::fmt::Display for ObjectCategory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key direction. Serialized as `1` / `-1`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

impl From<SortDirection> for i8 {
    fn from(value: SortDirection) -> Self {
        match value {
            SortDirection::Ascending => 1,
            SortDirection::Descending => -1,
        }
    }
}

impl TryFrom<i8> for SortDirection {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(SortDirection::Ascending),
            -1 => Ok(SortDirection::Descending),
            other => Err(format!("sort direction must be 1 or -1, got {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexType {
    #[default]
    Standard,
    Text,
    Hashed,
    Wildcard,
    Compound,
}

/// Who asked for an index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexOrigin {
    /// Baseline or category default.
    System,
    /// Declared by an operator or tenant override.
    #[default]
    Declared,
    /// Created from a detected query pattern.
    AutoSuggested,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Collation {
    pub locale: String,
    /// 1 = base letters only ... 5 = identical.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strength: Option<u8>,
    #[serde(default)]
    pub case_level: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexUsageStats {
    pub operations: u64,
    pub since: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IndexConfig {
    pub name: String,
    /// Ordered field -> direction.
    pub fields: IndexMap<String, SortDirection>,
    #[serde(default, rename = "Type")]
    pub index_type: IndexType,
    #[serde(default)]
    pub is_unique: bool,
    #[serde(default)]
    pub is_sparse: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_filter_expression: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collation: Option<Collation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_after_seconds: Option<u64>,
    #[serde(default, rename = "IsAutoGenerated")]
    pub origin: IndexOrigin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_stats: Option<IndexUsageStats>,
}

impl IndexConfig {
    pub fn new<I, S>(name: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = (S, SortDirection)>,
        S: Into<String>,
    {
        let fields: IndexMap<String, SortDirection> = fields.into_iter().map(|(f, d)| (f.into(), d)).collect();
        let index_type = if fields.len() > 1 { IndexType::Compound } else { IndexType::Standard };
        Self {
            name: name.into(),
            fields,
            index_type,
            is_unique: false,
            is_sparse: false,
            partial_filter_expression: None,
            collation: None,
            expire_after_seconds: None,
            origin: IndexOrigin::Declared,
            usage_stats: None,
        }
    }

    /// Single ascending field.
    pub fn single(name: impl Into<String>, field: impl Into<String>) -> Self {
        Self::new(name, [(field.into(), SortDirection::Ascending)])
    }

    pub fn unique(mut self) -> Self {
        self.is_unique = true;
        self
    }

    pub fn sparse(mut self) -> Self {
        self.is_sparse = true;
        self
    }

    pub fn with_type(mut self, index_type: IndexType) -> Self {
        self.index_type = index_type;
        self
    }

    pub fn with_origin(mut self, origin: IndexOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn expire_after(mut self, seconds: u64) -> Self {
        self.expire_after_seconds = Some(seconds);
        self
    }

    pub fn is_auto_generated(&self) -> bool {
        self.origin != IndexOrigin::Declared
    }
}

/// Copy selected fields of a referenced projection into this one.
///
/// With `source_field = "CustomerId"`, `target_aggregate_type = "Customer"`,
/// `fields = ["Name"]` and `prefix = "Customer"`, the document gains
/// `CustomerName` from `Entity_Customer[_id = CustomerId]` (same tenant).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DenormalizationConfig {
    pub source_field: String,
    pub target_aggregate_type: String,
    pub fields: Vec<String>,
    pub prefix: String,
}

impl DenormalizationConfig {
    /// Prefix defaults to the target aggregate type.
    pub fn new<I, S>(source_field: impl Into<String>, target_aggregate_type: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let target_aggregate_type = target_aggregate_type.into();
        Self {
            source_field: source_field.into(),
            prefix: target_aggregate_type.clone(),
            target_aggregate_type,
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn target_field(&self, field: &str) -> String {
        format!("{}{}", self.prefix, field)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ShardingConfig {
    pub enabled: bool,
    pub shard_key: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct CachingConfig {
    pub enabled: bool,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AggregationPipelineConfig {
    pub name: String,
    pub stages: Vec<JsonValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ValidationConfig {
    pub enabled: bool,
    /// Fields that must be present and non-null in every projected document.
    pub required_fields: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ArchivalConfig {
    pub enabled: bool,
    pub archive_after_days: Option<u32>,
    pub archive_collection: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    #[default]
    None,
    Snappy,
    Zlib,
    Zstd,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct CompressionConfig {
    pub enabled: bool,
    pub algorithm: CompressionAlgorithm,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct QueryPatternTrackingConfig {
    pub enabled: bool,
    /// Fraction of executed queries that are sampled, in `[0, 1]`.
    pub sample_rate: f64,
    /// Patterns below this count never produce suggestions.
    pub min_execution_count: u64,
    pub analysis_window_hours: u32,
    pub auto_create_indexes: bool,
    pub max_auto_indexes_per_run: usize,
    /// Append sort fields after the filter fields in suggested indexes.
    pub include_sort_fields: bool,
}

impl Default for QueryPatternTrackingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rate: 0.1,
            min_execution_count: 100,
            analysis_window_hours: 24,
            auto_create_indexes: false,
            max_auto_indexes_per_run: 3,
            include_sort_fields: true,
        }
    }
}

/// Effective configuration of one object type (optionally for one tenant).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SmartProjectionConfig {
    pub object_type: String,
    pub category: ObjectCategory,
    pub auto_optimize: bool,
    pub indexes: Vec<IndexConfig>,
    pub denormalizations: Vec<DenormalizationConfig>,
    pub ttl_days: Option<u32>,
    pub sharding: ShardingConfig,
    pub caching: CachingConfig,
    pub aggregation_pipelines: Vec<AggregationPipelineConfig>,
    pub validation: ValidationConfig,
    pub archival: ArchivalConfig,
    pub compression: CompressionConfig,
    pub query_pattern_tracking: QueryPatternTrackingConfig,
}

impl SmartProjectionConfig {
    pub fn index(&self, name: &str) -> Option<&IndexConfig> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// Reject configurations no backend could honor.
    pub fn validate(&self) -> Result<(), SmartConfigError> {
        let invalid = |msg: String| Err(SmartConfigError::Invalid {
            object_type: self.object_type.clone(),
            reason: msg,
        });

        let mut seen = std::collections::HashSet::new();
        for index in &self.indexes {
            if index.name.trim().is_empty() {
                return invalid("index with empty name".to_string());
            }
            if !seen.insert(index.name.as_str()) {
                return invalid(format!("duplicate index name '{}'", index.name));
            }
            if index.fields.is_empty() {
                return invalid(format!("index '{}' has no fields", index.name));
            }
        }
        if self.ttl_days == Some(0) {
            return invalid("ttl_days must be positive".to_string());
        }
        let rate = self.query_pattern_tracking.sample_rate;
        if !(0.0..=1.0).contains(&rate) {
            return invalid(format!("sample_rate {rate} outside [0, 1]"));
        }
        for denorm in &self.denormalizations {
            if denorm.source_field.is_empty() || denorm.fields.is_empty() {
                return invalid(format!(
                    "denormalization from '{}' needs a source field and at least one field",
                    denorm.target_aggregate_type
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SmartConfigError {
    #[error("invalid projection config for {object_type}: {reason}")]
    Invalid { object_type: String, reason: String },
    #[error("override source unavailable: {0}")]
    Source(String),
}

impl SmartConfigError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SmartConfigError::Invalid { .. } => FailureKind::Configuration,
            SmartConfigError::Source(_) => FailureKind::Transient,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_serializes_as_signed_int() {
        assert_eq!(serde_json::to_string(&SortDirection::Descending).unwrap(), "-1");
        let back: SortDirection = serde_json::from_str("1").unwrap();
        assert_eq!(back, SortDirection::Ascending);
        assert!(serde_json::from_str::<SortDirection>("2").is_err());
    }

    #[test]
    fn multi_field_index_is_compound() {
        let idx = IndexConfig::new(
            "idx_a_b",
            [("A", SortDirection::Ascending), ("B", SortDirection::Descending)],
        );
        assert_eq!(idx.index_type, IndexType::Compound);
        assert_eq!(idx.fields.keys().collect::<Vec<_>>(), vec!["A", "B"]);
        assert!(!idx.is_auto_generated());
    }

    #[test]
    fn index_config_reads_pascal_case() {
        let idx: IndexConfig = serde_json::from_value(serde_json::json!({
            "Name": "idx_customer",
            "Fields": { "CustomerId": 1, "DocumentDate": -1 },
            "Type": "Compound",
            "IsSparse": true
        }))
        .unwrap();
        assert_eq!(idx.fields.get("DocumentDate"), Some(&SortDirection::Descending));
        assert!(idx.is_sparse);
        assert_eq!(idx.origin, IndexOrigin::Declared);
    }

    #[test]
    fn denormalized_field_names_use_prefix() {
        let d = DenormalizationConfig::new("CustomerId", "Customer", ["Name", "Code"]);
        assert_eq!(d.target_field("Name"), "CustomerName");
        assert_eq!(d.clone().with_prefix("Cust_").target_field("Code"), "Cust_Code");
    }
}
