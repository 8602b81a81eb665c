use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decision::DenyReason;
use crate::types::{CredentialId, PrincipalId};

/// Routing metadata for the request that produced an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMeta {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
    /// Time spent producing the decision or serving the call.
    #[serde(default)]
    pub latency_ms: u64,
}

/// Immutable record emitted once per completed request.
///
/// Decoded at the stream boundary; downstream code matches on
/// [`UsageEventKind`] instead of probing optional fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    /// Unique event identifier (`UUIDv7`). Used as the aggregation dedupe key.
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Owning principal; absent when the credential could not be resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<PrincipalId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<CredentialId>,
    #[serde(default)]
    pub request: RequestMeta,
    #[serde(flatten)]
    pub kind: UsageEventKind,
}

/// The type-specific payload of a [`UsageEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UsageEventKind {
    /// A metered call that was authorized.
    ApiCall {
        /// Whether the downstream call succeeded.
        success: bool,
    },
    /// The presented credential was rejected, or the authorizer failed closed.
    AuthFailed { reason: DenyReason },
    /// The principal's shared quota was exhausted.
    RateLimited { usage: u64, limit: u64 },
    /// A usage threshold was crossed by an allowed call.
    ThresholdCrossed {
        threshold: u8,
        usage: u64,
        limit: u64,
        reset_at: DateTime<Utc>,
    },
}

impl UsageEventKind {
    /// Short lowercase label used for metric dimensions.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::ApiCall { .. } => "api_call",
            Self::AuthFailed { .. } => "auth_failed",
            Self::RateLimited { .. } => "rate_limited",
            Self::ThresholdCrossed { .. } => "threshold_crossed",
        }
    }
}

impl UsageEvent {
    /// Build an event stamped with a fresh `UUIDv7` and the current time.
    #[must_use]
    pub fn new(
        kind: UsageEventKind,
        principal: Option<PrincipalId>,
        credential_id: Option<CredentialId>,
        request: RequestMeta,
    ) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            timestamp: Utc::now(),
            principal,
            credential_id,
            request,
            kind,
        }
    }

    /// Key used to partition the event stream. Events of one principal stay
    /// ordered within a partition.
    #[must_use]
    pub fn partition_key(&self) -> &str {
        self.principal.as_ref().map_or("anonymous", PrincipalId::as_str)
    }

    /// Encode for the event stream.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a raw stream payload. Unknown `type` tags and missing required
    /// fields are rejected.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_type_tag_flat() {
        let ev = UsageEvent::new(
            UsageEventKind::RateLimited {
                usage: 10,
                limit: 10,
            },
            Some(PrincipalId::from("ada@example.com")),
            Some(CredentialId::from("cred_1")),
            RequestMeta::default(),
        );
        let json: serde_json::Value = serde_json::from_slice(&ev.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "rate_limited");
        assert_eq!(json["usage"], 10);
        assert_eq!(json["principal"], "ada@example.com");
    }

    #[test]
    fn decodes_auth_failure_without_principal() {
        let raw = br#"{
            "id": "0192e0a0-0000-7000-8000-000000000001",
            "timestamp": "2026-10-17T12:00:00Z",
            "type": "auth_failed",
            "reason": "invalid_credential",
            "request": {"path": "/v1/deadlines", "method": "GET", "source_ip": "203.0.113.9"}
        }"#;
        let ev = UsageEvent::decode(raw).unwrap();
        assert!(ev.principal.is_none());
        assert_eq!(ev.partition_key(), "anonymous");
        assert_eq!(
            ev.kind,
            UsageEventKind::AuthFailed {
                reason: DenyReason::InvalidCredential
            }
        );
        assert_eq!(ev.request.source_ip.as_deref(), Some("203.0.113.9"));
        assert_eq!(ev.kind.label(), "auth_failed");
    }

    #[test]
    fn rejects_unknown_type() {
        let raw = br#"{"id":"x","timestamp":"2026-10-17T12:00:00Z","type":"mystery"}"#;
        assert!(UsageEvent::decode(raw).is_err());
    }

    #[test]
    fn rejects_missing_variant_fields() {
        let raw = br#"{"id":"x","timestamp":"2026-10-17T12:00:00Z","type":"threshold_crossed","threshold":50}"#;
        assert!(UsageEvent::decode(raw).is_err());
    }
}
