//! Write-model collaborators the projection manager reads from.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use smartproj_core::{AggregateId, FailureKind, TenantId, Version};

/// Canonical current state of one aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateState {
    pub fields: Map<String, JsonValue>,
    pub version: Version,
}

impl AggregateState {
    pub fn new(version: Version, fields: Map<String, JsonValue>) -> Self {
        Self { fields, version }
    }

    /// Build from a JSON object; other values yield an empty field set.
    pub fn from_json(version: Version, value: JsonValue) -> Self {
        let fields = match value {
            JsonValue::Object(map) => map,
            _ => Map::new(),
        };
        Self { fields, version }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    #[error("write model unavailable: {0}")]
    Unavailable(String),
    #[error("write model returned unusable state: {0}")]
    Corrupt(String),
}

impl CollaboratorError {
    pub fn kind(&self) -> FailureKind {
        match self {
            CollaboratorError::Unavailable(_) => FailureKind::Transient,
            CollaboratorError::Corrupt(_) => FailureKind::Data,
        }
    }
}

/// Loads the current state of an aggregate from the write model.
#[async_trait]
pub trait AggregateSource: Send + Sync {
    /// `Ok(None)` when the aggregate does not exist (deleted or never created).
    async fn load_aggregate_state(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Option<AggregateState>, CollaboratorError>;
}

#[async_trait]
impl<S> AggregateSource for Arc<S>
where
    S: AggregateSource + ?Sized,
{
    async fn load_aggregate_state(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Option<AggregateState>, CollaboratorError> {
        (**self).load_aggregate_state(tenant_id, aggregate_id).await
    }
}

/// Tenant-defined extension (EAV) fields of hybrid aggregates.
#[async_trait]
pub trait ExtensionFieldSource: Send + Sync {
    async fn get_extension_fields(
        &self,
        tenant_id: TenantId,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<Map<String, JsonValue>, CollaboratorError>;
}

/// No extension fields anywhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExtensionFields;

#[async_trait]
impl ExtensionFieldSource for NoExtensionFields {
    async fn get_extension_fields(
        &self,
        _tenant_id: TenantId,
        _aggregate_type: &str,
        _aggregate_id: AggregateId,
    ) -> Result<Map<String, JsonValue>, CollaboratorError> {
        Ok(Map::new())
    }
}

/// In-memory write model for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryAggregateSource {
    states: RwLock<HashMap<(TenantId, AggregateId), AggregateState>>,
    unavailable: RwLock<bool>,
}

impl InMemoryAggregateSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, tenant_id: TenantId, aggregate_id: AggregateId, state: AggregateState) {
        if let Ok(mut states) = self.states.write() {
            states.insert((tenant_id, aggregate_id), state);
        }
    }

    pub fn remove(&self, tenant_id: TenantId, aggregate_id: AggregateId) {
        if let Ok(mut states) = self.states.write() {
            states.remove(&(tenant_id, aggregate_id));
        }
    }

    /// Simulate an outage: loads fail with [`CollaboratorError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut flag) = self.unavailable.write() {
            *flag = unavailable;
        }
    }
}

#[async_trait]
impl AggregateSource for InMemoryAggregateSource {
    async fn load_aggregate_state(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Option<AggregateState>, CollaboratorError> {
        if self.unavailable.read().map(|f| *f).unwrap_or(false) {
            return Err(CollaboratorError::Unavailable("in-memory write model offline".to_string()));
        }
        let states = self
            .states
            .read()
            .map_err(|_| CollaboratorError::Unavailable("write model lock poisoned".to_string()))?;
        Ok(states.get(&(tenant_id, aggregate_id)).cloned())
    }
}

/// In-memory extension field store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryExtensionFields {
    fields: RwLock<HashMap<(TenantId, String, AggregateId), Map<String, JsonValue>>>,
}

impl InMemoryExtensionFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(
        &self,
        tenant_id: TenantId,
        aggregate_type: impl Into<String>,
        aggregate_id: AggregateId,
        fields: Map<String, JsonValue>,
    ) {
        if let Ok(mut map) = self.fields.write() {
            map.insert((tenant_id, aggregate_type.into(), aggregate_id), fields);
        }
    }
}

#[async_trait]
impl ExtensionFieldSource for InMemoryExtensionFields {
    async fn get_extension_fields(
        &self,
        tenant_id: TenantId,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<Map<String, JsonValue>, CollaboratorError> {
        let map = self
            .fields
            .read()
            .map_err(|_| CollaboratorError::Unavailable("extension field lock poisoned".to_string()))?;
        Ok(map
            .get(&(tenant_id, aggregate_type.to_string(), aggregate_id))
            .cloned()
            .unwrap_or_default())
    }
}
