//! Envelope -> canonical state -> version-guarded projection write.

use std::sync::Arc;

use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, warn};

use smartproj_core::{AggregateId, FailureKind, TenantId, Version};
use smartproj_events::EventEnvelope;

use super::collaborators::{CollaboratorError, ExtensionFieldSource, NoExtensionFields};
use super::read_store::{ProjectionDocument, ReadStore, ReadStoreError, UpsertOutcome};
use super::registry::{AggregateDescriptor, AggregateRegistry, StorageModel, collection_name};
use crate::smart_config::{SmartConfigError, SmartProjectionConfig, SmartProjectionService};

/// Why an event was dropped without a write. All of these are data errors:
/// retrying the same delivery cannot change the result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    MalformedEnvelope(String),
    MissingAggregateType,
    UnknownAggregateType(String),
    /// The bus key names a different tenant than the envelope.
    TenantMismatch { delivered: TenantId, envelope: TenantId },
    AggregateNotFound,
    ValidationFailed { field: String },
}

impl core::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SkipReason::MalformedEnvelope(e) => write!(f, "malformed envelope: {e}"),
            SkipReason::MissingAggregateType => write!(f, "envelope has no aggregate type"),
            SkipReason::UnknownAggregateType(t) => write!(f, "unknown aggregate type '{t}'"),
            SkipReason::TenantMismatch { delivered, envelope } => {
                write!(f, "delivered for tenant {delivered} but envelope belongs to {envelope}")
            }
            SkipReason::AggregateNotFound => write!(f, "aggregate not found in write model"),
            SkipReason::ValidationFailed { field } => write!(f, "required field '{field}' missing"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectionOutcome {
    Inserted,
    Replaced,
    /// Stored version is equal or newer; nothing written.
    Stale,
    Skipped(SkipReason),
}

impl From<UpsertOutcome> for ProjectionOutcome {
    fn from(outcome: UpsertOutcome) -> Self {
        match outcome {
            UpsertOutcome::Inserted => ProjectionOutcome::Inserted,
            UpsertOutcome::Replaced => ProjectionOutcome::Replaced,
            UpsertOutcome::Stale => ProjectionOutcome::Stale,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectionError {
    #[error(transparent)]
    WriteModel(#[from] CollaboratorError),
    #[error(transparent)]
    ReadStore(#[from] ReadStoreError),
    #[error(transparent)]
    Config(#[from] SmartConfigError),
    /// The write model has not caught up with the event yet.
    #[error("write model for {aggregate_id} is at {loaded}, behind event {event}")]
    WriteModelBehind {
        aggregate_id: AggregateId,
        loaded: Version,
        event: Version,
    },
}

impl ProjectionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ProjectionError::WriteModel(e) => e.kind(),
            ProjectionError::ReadStore(e) => e.kind(),
            ProjectionError::Config(e) => e.kind(),
            ProjectionError::WriteModelBehind { .. } => FailureKind::Transient,
        }
    }
}

/// Builds and writes projection documents.
///
/// Writes are idempotent and order-safe through the read store's version
/// guard, so the manager needs no locking of its own.
pub struct ProjectionManager {
    registry: Arc<AggregateRegistry>,
    store: Arc<dyn ReadStore>,
    configs: Arc<SmartProjectionService>,
    extensions: Arc<dyn ExtensionFieldSource>,
}

impl core::fmt::Debug for ProjectionManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProjectionManager")
            .field("aggregate_types", &self.registry.aggregate_types())
            .finish_non_exhaustive()
    }
}

impl ProjectionManager {
    pub fn new(
        registry: Arc<AggregateRegistry>,
        store: Arc<dyn ReadStore>,
        configs: Arc<SmartProjectionService>,
    ) -> Self {
        Self {
            registry,
            store,
            configs,
            extensions: Arc::new(NoExtensionFields),
        }
    }

    pub fn with_extensions(mut self, extensions: Arc<dyn ExtensionFieldSource>) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn registry(&self) -> &AggregateRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn ReadStore> {
        &self.store
    }

    /// Decode a bus payload and project it.
    ///
    /// `tenant_id` is the tenant the delivery was keyed by, when known.
    pub async fn handle_event(
        &self,
        topic: &str,
        tenant_id: Option<TenantId>,
        payload: &str,
    ) -> Result<ProjectionOutcome, ProjectionError> {
        let envelope = match EventEnvelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(topic, error = %err, "skipping undecodable event");
                return Ok(ProjectionOutcome::Skipped(SkipReason::MalformedEnvelope(err.to_string())));
            }
        };

        if let Some(delivered) = tenant_id {
            if delivered != envelope.tenant_id() {
                let reason = SkipReason::TenantMismatch {
                    delivered,
                    envelope: envelope.tenant_id(),
                };
                warn!(topic, event_id = %envelope.event_id(), %reason, "skipping event");
                return Ok(ProjectionOutcome::Skipped(reason));
            }
        }

        self.project(&envelope).await
    }

    /// Project the aggregate an envelope refers to.
    pub async fn project(&self, envelope: &EventEnvelope) -> Result<ProjectionOutcome, ProjectionError> {
        let tenant_id = envelope.tenant_id();
        let aggregate_id = envelope.aggregate_id();

        let Some(aggregate_type) = envelope.aggregate_type() else {
            return Ok(self.skip(envelope, SkipReason::MissingAggregateType));
        };
        let Some(descriptor) = self.registry.get(aggregate_type) else {
            return Ok(self.skip(envelope, SkipReason::UnknownAggregateType(aggregate_type.to_string())));
        };

        let config = self
            .configs
            .resolve(tenant_id, aggregate_type, descriptor.category)
            .await?;

        let Some(state) = descriptor.source.load_aggregate_state(tenant_id, aggregate_id).await? else {
            return Ok(self.skip(envelope, SkipReason::AggregateNotFound));
        };
        if state.version < envelope.version() {
            return Err(ProjectionError::WriteModelBehind {
                aggregate_id,
                loaded: state.version,
                event: envelope.version(),
            });
        }

        let body = self.build_body(descriptor, &config, tenant_id, aggregate_id, state.fields).await?;
        if let Some(field) = missing_required_field(&config, &body) {
            return Ok(self.skip(envelope, SkipReason::ValidationFailed { field }));
        }

        let document = ProjectionDocument::new(tenant_id, aggregate_id, aggregate_type, state.version, body);
        let collection = descriptor.collection();
        let outcome = self.store.upsert_versioned(&collection, &document).await?;

        match outcome {
            UpsertOutcome::Stale => debug!(
                collection,
                tenant_id = %tenant_id,
                aggregate_id = %aggregate_id,
                version = %state.version,
                "stale projection write discarded"
            ),
            _ => info!(
                collection,
                tenant_id = %tenant_id,
                aggregate_id = %aggregate_id,
                version = %state.version,
                outcome = ?outcome,
                "projection written"
            ),
        }
        Ok(outcome.into())
    }

    /// Core fields, then extension fields (core wins), then denormalized joins.
    async fn build_body(
        &self,
        descriptor: &AggregateDescriptor,
        config: &SmartProjectionConfig,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        core: Map<String, JsonValue>,
    ) -> Result<Map<String, JsonValue>, ProjectionError> {
        let mut body = core;

        if descriptor.storage == StorageModel::Hybrid {
            let extension = self
                .extensions
                .get_extension_fields(tenant_id, &descriptor.aggregate_type, aggregate_id)
                .await?;
            for (field, value) in extension {
                body.entry(field).or_insert(value);
            }
        }

        for join in &config.denormalizations {
            let Some(target_id) = body
                .get(&join.source_field)
                .and_then(JsonValue::as_str)
                .and_then(|s| s.parse::<AggregateId>().ok())
            else {
                continue;
            };
            let target = self
                .store
                .get(&collection_name(&join.target_aggregate_type), tenant_id, target_id)
                .await?;
            let Some(target) = target else {
                debug!(
                    tenant_id = %tenant_id,
                    source_field = %join.source_field,
                    target = %target_id,
                    "denormalization target not projected yet"
                );
                continue;
            };
            for field in &join.fields {
                if let Some(value) = target.field(field) {
                    body.insert(join.target_field(field), value);
                }
            }
        }

        Ok(body)
    }

    fn skip(&self, envelope: &EventEnvelope, reason: SkipReason) -> ProjectionOutcome {
        warn!(
            event_id = %envelope.event_id(),
            event_type = envelope.event_type(),
            tenant_id = %envelope.tenant_id(),
            aggregate_id = %envelope.aggregate_id(),
            %reason,
            "skipping event"
        );
        ProjectionOutcome::Skipped(reason)
    }
}

fn missing_required_field(config: &SmartProjectionConfig, body: &Map<String, JsonValue>) -> Option<String> {
    if !config.validation.enabled {
        return None;
    }
    config
        .validation
        .required_fields
        .iter()
        .find(|field| body.get(field.as_str()).is_none_or(JsonValue::is_null))
        .cloned()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::projection::{AggregateState, InMemoryAggregateSource, InMemoryExtensionFields, InMemoryReadStore};
    use crate::smart_config::{
        ConfigCacheConfig, ConfigOverride, DenormalizationConfig, InMemoryOverrideSource, ObjectCategory,
        ValidationConfig,
    };

    struct Fixture {
        manager: ProjectionManager,
        source: Arc<InMemoryAggregateSource>,
        store: Arc<InMemoryReadStore>,
        overrides: Arc<InMemoryOverrideSource>,
        extensions: Arc<InMemoryExtensionFields>,
        tenant: TenantId,
    }

    fn fixture() -> Fixture {
        let source = Arc::new(InMemoryAggregateSource::new());
        let store = Arc::new(InMemoryReadStore::new());
        let overrides = Arc::new(InMemoryOverrideSource::new());
        let extensions = Arc::new(InMemoryExtensionFields::new());
        let registry = AggregateRegistry::new()
            .with(AggregateDescriptor::new("SalesOrder", ObjectCategory::Transaction, source.clone()))
            .with(AggregateDescriptor::new("Customer", ObjectCategory::Master, source.clone()).hybrid());
        let configs = Arc::new(SmartProjectionService::new(overrides.clone(), ConfigCacheConfig::default()));
        let manager = ProjectionManager::new(Arc::new(registry), store.clone(), configs)
            .with_extensions(extensions.clone());
        Fixture {
            manager,
            source,
            store,
            overrides,
            extensions,
            tenant: TenantId::new(),
        }
    }

    fn envelope(tenant: TenantId, aggregate_type: &str, id: AggregateId, version: u64) -> EventEnvelope {
        EventEnvelope::new(tenant, aggregate_type, id, Version::new(version), "Changed", json!({}))
    }

    fn state(version: u64, fields: JsonValue) -> AggregateState {
        AggregateState::from_json(Version::new(version), fields)
    }

    #[tokio::test]
    async fn replaying_the_same_envelope_is_a_no_op() {
        let f = fixture();
        let id = AggregateId::new();
        f.source.put(f.tenant, id, state(1, json!({"Status": "Open"})));
        let env = envelope(f.tenant, "SalesOrder", id, 1);

        assert_eq!(f.manager.project(&env).await.unwrap(), ProjectionOutcome::Inserted);
        let first = f.store.get("Entity_SalesOrder", f.tenant, id).await.unwrap().unwrap();

        assert_eq!(f.manager.project(&env).await.unwrap(), ProjectionOutcome::Stale);
        let second = f.store.get("Entity_SalesOrder", f.tenant, id).await.unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn late_old_event_does_not_clobber_newer_state() {
        let f = fixture();
        let id = AggregateId::new();

        f.source.put(f.tenant, id, state(2, json!({"Status": "Shipped"})));
        f.manager.project(&envelope(f.tenant, "SalesOrder", id, 2)).await.unwrap();

        // the write model is already at 2, so the late v1 event loads v2 and is stale
        let outcome = f.manager.project(&envelope(f.tenant, "SalesOrder", id, 1)).await.unwrap();
        assert_eq!(outcome, ProjectionOutcome::Stale);

        let stored = f.store.get("Entity_SalesOrder", f.tenant, id).await.unwrap().unwrap();
        assert_eq!(stored.version, Version::new(2));
        assert_eq!(stored.body["Status"], json!("Shipped"));
    }

    #[tokio::test]
    async fn newer_version_replaces_wholesale() {
        let f = fixture();
        let id = AggregateId::new();
        f.source.put(f.tenant, id, state(1, json!({"Status": "Open", "Draft": true})));
        f.manager.project(&envelope(f.tenant, "SalesOrder", id, 1)).await.unwrap();

        f.source.put(f.tenant, id, state(2, json!({"Status": "Open"})));
        let outcome = f.manager.project(&envelope(f.tenant, "SalesOrder", id, 2)).await.unwrap();
        assert_eq!(outcome, ProjectionOutcome::Replaced);

        let stored = f.store.get("Entity_SalesOrder", f.tenant, id).await.unwrap().unwrap();
        assert!(stored.body.get("Draft").is_none());
    }

    #[tokio::test]
    async fn lagging_write_model_is_retryable() {
        let f = fixture();
        let id = AggregateId::new();
        f.source.put(f.tenant, id, state(1, json!({})));

        let err = f.manager.project(&envelope(f.tenant, "SalesOrder", id, 3)).await.unwrap_err();
        assert!(matches!(err, ProjectionError::WriteModelBehind { .. }));
        assert_eq!(err.kind(), FailureKind::Transient);
    }

    #[tokio::test]
    async fn write_model_outage_is_transient() {
        let f = fixture();
        f.source.set_unavailable(true);
        let err = f
            .manager
            .project(&envelope(f.tenant, "SalesOrder", AggregateId::new(), 1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Transient);
    }

    #[tokio::test]
    async fn unresolvable_events_are_skipped() {
        let f = fixture();
        let id = AggregateId::new();

        let unknown = f.manager.project(&envelope(f.tenant, "Payroll", id, 1)).await.unwrap();
        assert_eq!(unknown, ProjectionOutcome::Skipped(SkipReason::UnknownAggregateType("Payroll".into())));

        let untyped = envelope(f.tenant, "SalesOrder", id, 1).without_aggregate_type();
        assert_eq!(
            f.manager.project(&untyped).await.unwrap(),
            ProjectionOutcome::Skipped(SkipReason::MissingAggregateType)
        );

        let missing = f.manager.project(&envelope(f.tenant, "SalesOrder", id, 1)).await.unwrap();
        assert_eq!(missing, ProjectionOutcome::Skipped(SkipReason::AggregateNotFound));

        let garbage = f.manager.handle_event("sales.order.changed", None, "{not json").await.unwrap();
        assert!(matches!(garbage, ProjectionOutcome::Skipped(SkipReason::MalformedEnvelope(_))));
    }

    #[tokio::test]
    async fn tenant_mismatch_is_skipped() {
        let f = fixture();
        let id = AggregateId::new();
        f.source.put(f.tenant, id, state(1, json!({})));
        let payload = envelope(f.tenant, "SalesOrder", id, 1).encode().unwrap();

        let other = TenantId::new();
        let outcome = f.manager.handle_event("sales.order.changed", Some(other), &payload).await.unwrap();
        assert!(matches!(outcome, ProjectionOutcome::Skipped(SkipReason::TenantMismatch { .. })));

        let ok = f.manager.handle_event("sales.order.changed", Some(f.tenant), &payload).await.unwrap();
        assert_eq!(ok, ProjectionOutcome::Inserted);
    }

    #[tokio::test]
    async fn hybrid_aggregates_merge_extension_fields_under_core() {
        let f = fixture();
        let id = AggregateId::new();
        f.source.put(f.tenant, id, state(1, json!({"Code": "C-1", "Name": "Core"})));
        let mut ext = Map::new();
        ext.insert("Name".into(), json!("Extension"));
        ext.insert("LoyaltyTier".into(), json!("Gold"));
        f.extensions.put(f.tenant, "Customer", id, ext);

        f.manager.project(&envelope(f.tenant, "Customer", id, 1)).await.unwrap();
        let doc = f.store.get("Entity_Customer", f.tenant, id).await.unwrap().unwrap();
        assert_eq!(doc.body["Name"], json!("Core"));
        assert_eq!(doc.body["LoyaltyTier"], json!("Gold"));
    }

    #[tokio::test]
    async fn denormalized_fields_are_copied_from_target_projection() {
        let f = fixture();
        let customer = AggregateId::new();
        f.source.put(f.tenant, customer, state(1, json!({"Code": "C-1", "Name": "Acme"})));
        f.manager.project(&envelope(f.tenant, "Customer", customer, 1)).await.unwrap();

        f.overrides.set_object_override(
            "SalesOrder",
            ConfigOverride {
                denormalizations: vec![DenormalizationConfig::new("CustomerId", "Customer", ["Name", "Code"])],
                ..ConfigOverride::default()
            },
        );

        let order = AggregateId::new();
        f.source.put(f.tenant, order, state(1, json!({"CustomerId": customer.to_string()})));
        f.manager.project(&envelope(f.tenant, "SalesOrder", order, 1)).await.unwrap();

        let doc = f.store.get("Entity_SalesOrder", f.tenant, order).await.unwrap().unwrap();
        assert_eq!(doc.body["CustomerName"], json!("Acme"));
        assert_eq!(doc.body["CustomerCode"], json!("C-1"));
        let binding = doc.to_json();
        let keys: Vec<&str> = binding.as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(&keys[..3], &["CustomerId", "CustomerName", "CustomerCode"]);
    }

    #[tokio::test]
    async fn missing_required_field_skips_write() {
        let f = fixture();
        f.overrides.set_tenant_override(
            f.tenant,
            "SalesOrder",
            ConfigOverride {
                validation: Some(ValidationConfig {
                    enabled: true,
                    required_fields: vec!["Status".into()],
                }),
                ..ConfigOverride::default()
            },
        );
        let id = AggregateId::new();
        f.source.put(f.tenant, id, state(1, json!({"Status": null})));

        let outcome = f.manager.project(&envelope(f.tenant, "SalesOrder", id, 1)).await.unwrap();
        assert_eq!(
            outcome,
            ProjectionOutcome::Skipped(SkipReason::ValidationFailed { field: "Status".into() })
        );
        assert_eq!(f.store.count("Entity_SalesOrder"), 0);
    }
}
