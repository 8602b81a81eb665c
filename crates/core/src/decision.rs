use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{CredentialId, PrincipalId};

/// Internal reason an authorization was denied.
///
/// Reason codes are recorded for audit and analytics only. Callers always see
/// [`Decision::PUBLIC_DENY_MESSAGE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// Unknown, inactive, or deleted-mid-flight credential.
    InvalidCredential,
    /// Aggregate usage already meets the limit.
    QuotaExceeded,
    /// The store or stream failed; the authorizer fails closed.
    InternalError,
}

impl DenyReason {
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::InvalidCredential => "invalid_credential",
            Self::QuotaExceeded => "quota_exceeded",
            Self::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Context handed to the downstream response pipeline on an allowed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContext {
    pub principal: PrincipalId,
    pub credential_id: CredentialId,
    pub credential_name: String,
    /// Aggregate usage including this call.
    pub usage_count: u64,
    pub usage_limit: u64,
    pub remaining_calls: u64,
    pub usage_reset_date: DateTime<Utc>,
}

impl AuthContext {
    /// Flatten into the string-keyed map the response pipeline consumes.
    #[must_use]
    pub fn to_context_map(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("principalId".to_owned(), self.principal.to_string()),
            ("credentialId".to_owned(), self.credential_id.to_string()),
            ("credentialName".to_owned(), self.credential_name.clone()),
            ("usageCount".to_owned(), self.usage_count.to_string()),
            ("usageLimit".to_owned(), self.usage_limit.to_string()),
            ("remainingCalls".to_owned(), self.remaining_calls.to_string()),
            (
                "usageResetDate".to_owned(),
                self.usage_reset_date
                    .to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
        ])
    }
}

/// Result of authorizing one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow(AuthContext),
    Deny(DenyReason),
}

impl Decision {
    /// The only message a denied caller ever receives.
    pub const PUBLIC_DENY_MESSAGE: &'static str = "Unauthorized";

    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow(_))
    }

    #[must_use]
    pub fn deny_reason(&self) -> Option<DenyReason> {
        match self {
            Self::Allow(_) => None,
            Self::Deny(reason) => Some(*reason),
        }
    }

    #[must_use]
    pub fn context(&self) -> Option<&AuthContext> {
        match self {
            Self::Allow(ctx) => Some(ctx),
            Self::Deny(_) => None,
        }
    }

    /// Caller-facing message. Identical for every deny reason.
    #[must_use]
    pub fn public_message(&self) -> Option<&'static str> {
        match self {
            Self::Allow(_) => None,
            Self::Deny(_) => Some(Self::PUBLIC_DENY_MESSAGE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> AuthContext {
        AuthContext {
            principal: PrincipalId::from("ada@example.com"),
            credential_id: CredentialId::from("cred_1"),
            credential_name: "ci".into(),
            usage_count: 10_000,
            usage_limit: 10_000,
            remaining_calls: 0,
            usage_reset_date: DateTime::parse_from_rfc3339("2026-11-16T08:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    #[test]
    fn context_map_has_expected_keys() {
        let map = ctx().to_context_map();
        assert_eq!(map["principalId"], "ada@example.com");
        assert_eq!(map["credentialId"], "cred_1");
        assert_eq!(map["credentialName"], "ci");
        assert_eq!(map["usageCount"], "10000");
        assert_eq!(map["usageLimit"], "10000");
        assert_eq!(map["remainingCalls"], "0");
        assert_eq!(map["usageResetDate"], "2026-11-16T08:00:00Z");
        assert_eq!(map.len(), 7);
    }

    #[test]
    fn every_deny_reason_renders_the_same_public_message() {
        for reason in [
            DenyReason::InvalidCredential,
            DenyReason::QuotaExceeded,
            DenyReason::InternalError,
        ] {
            let d = Decision::Deny(reason);
            assert_eq!(d.public_message(), Some("Unauthorized"));
            assert_eq!(d.deny_reason(), Some(reason));
            assert!(!d.is_allowed());
        }
        assert_eq!(Decision::Allow(ctx()).public_message(), None);
    }

    #[test]
    fn reason_codes_are_stable() {
        assert_eq!(DenyReason::InvalidCredential.code(), "invalid_credential");
        assert_eq!(DenyReason::QuotaExceeded.code(), "quota_exceeded");
        assert_eq!(DenyReason::InternalError.to_string(), "internal_error");
        assert_eq!(
            serde_json::to_string(&DenyReason::QuotaExceeded).unwrap(),
            "\"quota_exceeded\""
        );
    }
}
