use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use smartproj_core::{AggregateId, FailureKind, TenantId, Version};

/// Envelope for a write-model event, as carried in an outbox payload.
///
/// Notes:
/// - **Multi-tenancy** is carried here via `tenant_id`.
/// - `version` is the monotonic per-aggregate counter after the mutation.
/// - `aggregate_type` may be absent on the wire; consumers treat that as a
///   data error and skip the envelope.
/// - Field names are PascalCase on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EventEnvelope {
    event_id: Uuid,
    event_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    aggregate_type: Option<String>,
    aggregate_id: AggregateId,
    tenant_id: TenantId,

    timestamp: DateTime<Utc>,
    version: Version,

    /// Type-specific data.
    #[serde(default)]
    data: JsonValue,
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("failed to encode envelope: {0}")]
    Encode(String),
}

impl EnvelopeError {
    pub fn kind(&self) -> FailureKind {
        FailureKind::Data
    }
}

impl EventEnvelope {
    pub fn new(
        tenant_id: TenantId,
        aggregate_type: impl Into<String>,
        aggregate_id: AggregateId,
        version: Version,
        event_type: impl Into<String>,
        data: JsonValue,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type: event_type.into(),
            aggregate_type: Some(aggregate_type.into()),
            aggregate_id,
            tenant_id,
            timestamp: Utc::now(),
            version,
            data,
        }
    }

    /// Drop the aggregate type (used to model envelopes from older producers).
    pub fn without_aggregate_type(mut self) -> Self {
        self.aggregate_type = None;
        self
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Aggregate type, if present and non-blank.
    pub fn aggregate_type(&self) -> Option<&str> {
        self.aggregate_type
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn data(&self) -> &JsonValue {
        &self.data
    }

    pub fn encode(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(|e| EnvelopeError::Encode(e.to_string()))
    }

    pub fn decode(payload: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(payload).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_is_pascal_case() {
        let env = EventEnvelope::new(
            TenantId::new(),
            "SalesOrder",
            AggregateId::new(),
            Version::new(2),
            "sales.order.confirmed",
            serde_json::json!({"Total": 10}),
        );
        let json: JsonValue = serde_json::from_str(&env.encode().unwrap()).unwrap();

        assert_eq!(json["AggregateType"], "SalesOrder");
        assert_eq!(json["Version"], 2);
        assert_eq!(json["Data"]["Total"], 10);
    }

    #[test]
    fn missing_aggregate_type_decodes_as_none() {
        let raw = format!(
            r#"{{"EventId":"{}","EventType":"x.y.z","AggregateId":"{}","TenantId":"{}","Timestamp":"2024-01-01T00:00:00Z","Version":1}}"#,
            Uuid::now_v7(),
            AggregateId::new(),
            TenantId::new()
        );
        let env = EventEnvelope::decode(&raw).unwrap();
        assert_eq!(env.aggregate_type(), None);
        assert_eq!(env.data(), &JsonValue::Null);
    }

    #[test]
    fn blank_aggregate_type_is_treated_as_missing() {
        let env = EventEnvelope::new(
            TenantId::new(),
            "   ",
            AggregateId::new(),
            Version::new(1),
            "x.changed",
            JsonValue::Null,
        );
        assert_eq!(env.aggregate_type(), None);
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            EventEnvelope::decode("{not json"),
            Err(EnvelopeError::Malformed(_))
        ));
    }
}
