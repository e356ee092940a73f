//! Declared, baseline and suggested indexes for projection collections.

use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::backend::{CreateOutcome, IndexBackend, IndexDefinition, IndexError, IndexKey};
use crate::cancel::Cancellation;
use crate::projection::{FIELD_PROJECTED_AT, FIELD_TENANT_ID};
use crate::query_patterns::DetectedQueryPattern;
use crate::smart_config::{IndexOrigin, QueryPatternTrackingConfig, SmartProjectionConfig, SortDirection};

pub const IDX_TENANT_ID: &str = "idx_tenantId";
pub const IDX_PROJECTED_AT: &str = "idx_projectedAt";
pub const IDX_TENANT_PROJECTED_AT: &str = "idx_tenant_projectedAt";
pub const IDX_TTL: &str = "idx_ttl";

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Indexes every projection collection carries regardless of configuration.
pub fn baseline_indexes() -> Vec<IndexDefinition> {
    vec![
        IndexDefinition::new(IDX_TENANT_ID, [(FIELD_TENANT_ID, IndexKey::Ascending)]).with_origin(IndexOrigin::System),
        IndexDefinition::new(IDX_PROJECTED_AT, [(FIELD_PROJECTED_AT, IndexKey::Ascending)])
            .with_origin(IndexOrigin::System),
        IndexDefinition::new(
            IDX_TENANT_PROJECTED_AT,
            [(FIELD_TENANT_ID, IndexKey::Ascending), (FIELD_PROJECTED_AT, IndexKey::Descending)],
        )
        .with_origin(IndexOrigin::System),
    ]
}

/// TTL index expiring documents `days` after their last projection.
pub fn ttl_index(days: u32) -> IndexDefinition {
    IndexDefinition::new(IDX_TTL, [(FIELD_PROJECTED_AT, IndexKey::Ascending)])
        .expire_after(u64::from(days) * SECONDS_PER_DAY)
        .with_origin(IndexOrigin::System)
}

/// Normalized view of an existing index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexInfo {
    pub name: String,
    pub keys: IndexMap<String, IndexKey>,
    pub unique: bool,
}

impl From<IndexDefinition> for IndexInfo {
    fn from(def: IndexDefinition) -> Self {
        Self {
            name: def.name,
            keys: def.keys,
            unique: def.unique,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnsureReport {
    pub created: Vec<String>,
    pub already_present: Vec<String>,
}

/// An index proposed from a detected query pattern.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct IndexSuggestion {
    pub pattern_hash: String,
    pub collection: String,
    pub suggested_index_name: String,
    pub fields: IndexMap<String, SortDirection>,
    pub estimated_impact: f64,
    pub reason: String,
}

impl IndexSuggestion {
    pub fn to_definition(&self) -> IndexDefinition {
        IndexDefinition::new(
            self.suggested_index_name.clone(),
            self.fields.iter().map(|(f, d)| (f.clone(), IndexKey::from(*d))),
        )
        .with_origin(IndexOrigin::AutoSuggested)
        .in_background()
    }
}

/// Keeps collection indexes in line with configuration and observed traffic.
///
/// Every operation is safe to run concurrently from several instances: the
/// backend's create is idempotent per name and spec.
#[derive(Clone)]
pub struct IndexManager {
    backend: Arc<dyn IndexBackend>,
}

impl core::fmt::Debug for IndexManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IndexManager").finish_non_exhaustive()
    }
}

impl IndexManager {
    pub fn new(backend: Arc<dyn IndexBackend>) -> Self {
        Self { backend }
    }

    /// Guarantee baseline indexes, every declared index of `config` and, when
    /// `config.ttl_days` is set, `idx_ttl`.
    ///
    /// A different spec already registered under one of these names is
    /// returned as [`IndexError::Conflict`]; indexes processed before the
    /// conflict stay created.
    pub async fn ensure_indexes(
        &self,
        collection: &str,
        config: Option<&SmartProjectionConfig>,
        cancel: &Cancellation,
    ) -> Result<EnsureReport, IndexError> {
        let mut wanted = baseline_indexes();
        if let Some(config) = config {
            wanted.extend(config.indexes.iter().map(IndexDefinition::from_config));
            if let Some(days) = config.ttl_days {
                wanted.push(ttl_index(days));
            }
        }

        let mut report = EnsureReport::default();
        for definition in &wanted {
            cancel.check()?;
            match self.backend.create_index(collection, definition).await {
                Ok(CreateOutcome::Created) => {
                    info!(collection, index = %definition.name, keys = %definition.key_spec(), "index created");
                    report.created.push(definition.name.clone());
                }
                Ok(CreateOutcome::AlreadyExists) => report.already_present.push(definition.name.clone()),
                Err(err) => {
                    warn!(collection, index = %definition.name, error = %err, "ensure index failed");
                    return Err(err);
                }
            }
        }
        Ok(report)
    }

    pub async fn drop_index(&self, collection: &str, name: &str) -> Result<bool, IndexError> {
        let dropped = self.backend.drop_index(collection, name).await?;
        if dropped {
            info!(collection, index = name, "index dropped");
        }
        Ok(dropped)
    }

    pub async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexInfo>, IndexError> {
        Ok(self
            .backend
            .list_indexes(collection)
            .await?
            .into_iter()
            .map(IndexInfo::from)
            .collect())
    }

    /// Turn frequent, uncovered patterns into suggestions (highest impact first).
    ///
    /// Patterns already served by an existing index get `index_created = true`.
    pub async fn suggest_indexes(
        &self,
        collection: &str,
        patterns: &mut [DetectedQueryPattern],
        tracking: &QueryPatternTrackingConfig,
        cancel: &Cancellation,
    ) -> Result<Vec<IndexSuggestion>, IndexError> {
        cancel.check()?;
        let existing = self.backend.list_indexes(collection).await?;

        let mut suggestions: Vec<IndexSuggestion> = Vec::new();
        for pattern in patterns.iter_mut() {
            if pattern.execution_count < tracking.min_execution_count {
                continue;
            }

            if existing.iter().any(|index| covers(index, pattern)) {
                if !pattern.index_created {
                    debug!(collection, pattern = %pattern.pattern_hash, "pattern already covered by an index");
                }
                pattern.index_created = true;
                continue;
            }
            pattern.index_created = false;

            let Some(suggestion) = build_suggestion(collection, pattern, tracking.include_sort_fields) else {
                continue;
            };
            if suggestions.iter().any(|s| s.fields == suggestion.fields) {
                continue;
            }
            suggestions.push(suggestion);
        }

        suggestions.sort_by(|a, b| b.estimated_impact.total_cmp(&a.estimated_impact));
        Ok(suggestions)
    }

    /// Build a suggested index in the background, marked auto-generated.
    pub async fn create_suggested_index(
        &self,
        collection: &str,
        suggestion: &IndexSuggestion,
        cancel: &Cancellation,
    ) -> Result<CreateOutcome, IndexError> {
        cancel.check()?;
        let definition = suggestion.to_definition();
        let outcome = self.backend.create_index(collection, &definition).await?;
        if outcome == CreateOutcome::Created {
            info!(
                collection,
                index = %definition.name,
                keys = %definition.key_spec(),
                impact = suggestion.estimated_impact,
                "auto-generated index created"
            );
        }
        Ok(outcome)
    }
}

/// An ordered index whose leading keys are exactly the pattern's filter fields
/// (in any order) serves the pattern. Partial indexes never count.
fn covers(index: &IndexDefinition, pattern: &DetectedQueryPattern) -> bool {
    if index.partial_filter.is_some() || pattern.filter_fields.is_empty() {
        return false;
    }
    let n = pattern.filter_fields.len();
    if index.keys.len() < n {
        return false;
    }
    index
        .keys
        .iter()
        .take(n)
        .all(|(field, key)| key.is_ordered() && pattern.filter_fields.iter().any(|f| f == field))
}

fn build_suggestion(
    collection: &str,
    pattern: &DetectedQueryPattern,
    include_sort_fields: bool,
) -> Option<IndexSuggestion> {
    let mut fields: IndexMap<String, SortDirection> = pattern
        .filter_fields
        .iter()
        .map(|f| (f.clone(), SortDirection::Ascending))
        .collect();
    if include_sort_fields || fields.is_empty() {
        for sort in &pattern.sort_fields {
            fields.entry(sort.field.clone()).or_insert(sort.direction);
        }
    }
    if fields.is_empty() {
        return None;
    }

    let impact = estimated_impact(pattern);
    let reason = format!(
        "{} executions averaging {:.1} ms, examining {:.0} docs to return {:.0}; no index covers {:?}",
        pattern.execution_count,
        pattern.average_execution_time_ms,
        pattern.average_docs_examined,
        pattern.average_docs_returned,
        pattern.filter_fields,
    );

    Some(IndexSuggestion {
        pattern_hash: pattern.pattern_hash.clone(),
        collection: collection.to_string(),
        suggested_index_name: suggested_name(fields.keys(), &pattern.pattern_hash),
        fields,
        estimated_impact: impact,
        reason,
    })
}

/// `ln(1 + count) * avg_ms * max(1, examined / returned)`.
pub fn estimated_impact(pattern: &DetectedQueryPattern) -> f64 {
    (1.0 + pattern.execution_count as f64).ln() * pattern.average_execution_time_ms.max(0.0) * pattern.selectivity_penalty()
}

/// `auto_<fields>_<hash8>`, fields lowercased with non-alphanumerics dropped.
fn suggested_name<'a>(fields: impl Iterator<Item = &'a String>, pattern_hash: &str) -> String {
    let mut stem: String = fields
        .map(|f| f.chars().filter(char::is_ascii_alphanumeric).collect::<String>().to_ascii_lowercase())
        .filter(|f| !f.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    stem.truncate(40);
    let hash: String = pattern_hash.chars().take(8).collect();
    format!("auto_{stem}_{hash}")
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::indexes::InMemoryIndexBackend;
    use crate::query_patterns::{QueryShape, SortField};
    use crate::smart_config::{IndexConfig, ObjectCategory, default_config_for};

    fn manager() -> (IndexManager, Arc<InMemoryIndexBackend>) {
        let backend = Arc::new(InMemoryIndexBackend::new());
        (IndexManager::new(backend.clone()), backend)
    }

    fn pattern(fields: &[&str], sort: Vec<SortField>, count: u64) -> DetectedQueryPattern {
        let shape = QueryShape::new(fields.iter().copied(), sort);
        let mut p = DetectedQueryPattern::new("Entity_SalesOrder", &shape, Utc::now());
        p.execution_count = count;
        p.average_execution_time_ms = 25.0;
        p.average_docs_examined = 1000.0;
        p.average_docs_returned = 10.0;
        p
    }

    #[tokio::test]
    async fn baseline_without_config_exactly_once() {
        let (mgr, backend) = manager();
        let never = Cancellation::never();

        for aggregate in ["Entity_SalesOrder", "Entity_Customer"] {
            mgr.ensure_indexes(aggregate, None, &never).await.unwrap();
            mgr.ensure_indexes(aggregate, None, &never).await.unwrap();

            let names: Vec<String> = mgr.list_indexes(aggregate).await.unwrap().into_iter().map(|i| i.name).collect();
            assert_eq!(names, vec![IDX_TENANT_ID, IDX_PROJECTED_AT, IDX_TENANT_PROJECTED_AT]);
            for name in &names {
                assert_eq!(backend.build_count(aggregate, name), 1);
            }
        }
    }

    #[tokio::test]
    async fn ttl_index_expires_after_configured_days() {
        let (mgr, backend) = manager();
        let mut config = default_config_for("SalesOrder", ObjectCategory::Transaction);
        config.ttl_days = Some(30);

        let first = mgr.ensure_indexes("Entity_SalesOrder", Some(&config), &Cancellation::never()).await.unwrap();
        let second = mgr.ensure_indexes("Entity_SalesOrder", Some(&config), &Cancellation::never()).await.unwrap();
        assert!(first.created.contains(&IDX_TTL.to_string()));
        assert!(second.created.is_empty());

        let ttl = backend
            .list_indexes("Entity_SalesOrder")
            .await
            .unwrap()
            .into_iter()
            .find(|i| i.name == IDX_TTL)
            .unwrap();
        assert_eq!(ttl.expire_after_seconds, Some(30 * 24 * 60 * 60));
        assert_eq!(backend.build_count("Entity_SalesOrder", IDX_TTL), 1);
    }

    #[tokio::test]
    async fn declared_indexes_are_created_verbatim() {
        let (mgr, backend) = manager();
        let config = default_config_for("Customer", ObjectCategory::Master);
        mgr.ensure_indexes("Entity_Customer", Some(&config), &Cancellation::never()).await.unwrap();

        let code = backend
            .list_indexes("Entity_Customer")
            .await
            .unwrap()
            .into_iter()
            .find(|i| i.name == "idx_code")
            .unwrap();
        assert!(code.unique);
        assert_eq!(code.origin, IndexOrigin::System);
    }

    #[tokio::test]
    async fn conflicting_spec_is_surfaced() {
        let (mgr, _backend) = manager();
        let mut config = default_config_for("SalesOrder", ObjectCategory::Transaction);
        config.indexes.push(IndexConfig::single(IDX_TENANT_ID, "SomethingElse"));

        let err = mgr
            .ensure_indexes("Entity_SalesOrder", Some(&config), &Cancellation::never())
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Conflict { ref name, .. } if name == IDX_TENANT_ID));
    }

    #[tokio::test]
    async fn cancelled_ensure_stops_early() {
        let (mgr, backend) = manager();
        let source = crate::cancel::CancellationSource::new();
        source.cancel();
        let err = mgr.ensure_indexes("c", None, &source.token()).await.unwrap_err();
        assert_eq!(err, IndexError::Cancelled);
        assert!(backend.list_indexes("c").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn uncovered_frequent_pattern_yields_suggestion() {
        let (mgr, _backend) = manager();
        let mut patterns = vec![pattern(&["Status", "CustomerId"], vec![], 500)];
        let tracking = QueryPatternTrackingConfig::default();

        let suggestions = mgr
            .suggest_indexes("Entity_SalesOrder", &mut patterns, &tracking, &Cancellation::never())
            .await
            .unwrap();

        assert_eq!(suggestions.len(), 1);
        let s = &suggestions[0];
        assert!(s.fields.contains_key("Status"));
        assert!(s.fields.contains_key("CustomerId"));
        assert!(s.suggested_index_name.starts_with("auto_customerid_status_"));
        assert!(s.estimated_impact > 0.0);
        assert!(!patterns[0].index_created);
    }

    #[tokio::test]
    async fn covered_pattern_is_flagged_not_suggested() {
        let (mgr, backend) = manager();
        backend
            .create_index("Entity_SalesOrder", &IndexDefinition::new("idx_status", [("Status", IndexKey::Ascending)]))
            .await
            .unwrap();
        let mut patterns = vec![pattern(&["Status"], vec![], 500)];

        let suggestions = mgr
            .suggest_indexes(
                "Entity_SalesOrder",
                &mut patterns,
                &QueryPatternTrackingConfig::default(),
                &Cancellation::never(),
            )
            .await
            .unwrap();

        assert!(suggestions.is_empty());
        assert!(patterns[0].index_created);
    }

    #[tokio::test]
    async fn prefix_coverage_requires_all_filter_fields_up_front() {
        let (mgr, backend) = manager();
        backend
            .create_index(
                "c",
                &IndexDefinition::new("idx_s_d", [("Status", IndexKey::Ascending), ("DocumentDate", IndexKey::Descending)]),
            )
            .await
            .unwrap();
        let tracking = QueryPatternTrackingConfig::default();

        let mut covered = vec![pattern(&["DocumentDate", "Status"], vec![], 500)];
        assert!(mgr.suggest_indexes("c", &mut covered, &tracking, &Cancellation::never()).await.unwrap().is_empty());

        let mut uncovered = vec![pattern(&["DocumentDate"], vec![], 500)];
        assert_eq!(
            mgr.suggest_indexes("c", &mut uncovered, &tracking, &Cancellation::never()).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn infrequent_patterns_are_ignored() {
        let (mgr, _backend) = manager();
        let mut patterns = vec![pattern(&["Status"], vec![], 99)];
        let suggestions = mgr
            .suggest_indexes("c", &mut patterns, &QueryPatternTrackingConfig::default(), &Cancellation::never())
            .await
            .unwrap();
        assert!(suggestions.is_empty());
    }

    #[tokio::test]
    async fn sort_fields_follow_filter_fields() {
        let (mgr, _backend) = manager();
        let mut patterns = vec![pattern(&["Status"], vec![SortField::desc("DocumentDate")], 200)];
        let suggestions = mgr
            .suggest_indexes("c", &mut patterns, &QueryPatternTrackingConfig::default(), &Cancellation::never())
            .await
            .unwrap();

        let keys: Vec<(&String, &SortDirection)> = suggestions[0].fields.iter().collect();
        assert_eq!(keys[0].0, "Status");
        assert_eq!((keys[1].0.as_str(), *keys[1].1), ("DocumentDate", SortDirection::Descending));
    }

    #[tokio::test]
    async fn suggested_index_is_background_and_auto_generated() {
        let (mgr, backend) = manager();
        let mut patterns = vec![pattern(&["Status", "CustomerId"], vec![], 500)];
        let tracking = QueryPatternTrackingConfig::default();
        let suggestion = mgr
            .suggest_indexes("c", &mut patterns, &tracking, &Cancellation::never())
            .await
            .unwrap()
            .remove(0);

        let outcome = mgr.create_suggested_index("c", &suggestion, &Cancellation::never()).await.unwrap();
        assert_eq!(outcome, CreateOutcome::Created);

        let built = backend
            .list_indexes("c")
            .await
            .unwrap()
            .into_iter()
            .find(|i| i.name == suggestion.suggested_index_name)
            .unwrap();
        assert!(built.background);
        assert_eq!(built.origin, IndexOrigin::AutoSuggested);

        // the same pattern is now covered
        let again = mgr.suggest_indexes("c", &mut patterns, &tracking, &Cancellation::never()).await.unwrap();
        assert!(again.is_empty());
        assert!(patterns[0].index_created);
    }

    #[test]
    fn impact_grows_with_frequency_and_cost() {
        let cheap = pattern(&["A"], vec![], 10);
        let busy = pattern(&["A"], vec![], 10_000);
        assert!(estimated_impact(&busy) > estimated_impact(&cheap));
    }
}
