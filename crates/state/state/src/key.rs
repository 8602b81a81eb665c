use serde::{Deserialize, Serialize};

/// Scope used for keys that do not belong to a single principal.
pub const GLOBAL_SCOPE: &str = "global";

/// The kind of state being stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    /// Credential record, addressed by credential id.
    Credential,
    /// Secret digest to credential id lookup.
    DigestIndex,
    /// Current quota window of a principal.
    QuotaWindow,
    /// Minute/hour/day rollup counters.
    Rollup,
    /// Short-lived per-minute ring for the last-hour view.
    Dashboard,
    /// Authentication failure tallies.
    Security,
    /// Individual rate-limited request records.
    RateLimited,
    /// Processed-event markers.
    Dedup,
    /// Webhook subscription record.
    Subscription,
    /// Notification preferences of a principal.
    Preference,
    /// Threshold notification markers.
    NotificationMarker,
    Custom(String),
}

impl KeyKind {
    /// Return a string representation of the key kind.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Credential => "credential",
            Self::DigestIndex => "digest_index",
            Self::QuotaWindow => "quota_window",
            Self::Rollup => "rollup",
            Self::Dashboard => "dashboard",
            Self::Security => "security",
            Self::RateLimited => "rate_limited",
            Self::Dedup => "dedup",
            Self::Subscription => "subscription",
            Self::Preference => "preference",
            Self::NotificationMarker => "notification_marker",
            Self::Custom(s) => s.as_str(),
        }
    }
}

impl std::fmt::Display for KeyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key used to address state entries in the store.
///
/// `scope` is usually a principal id, or [`GLOBAL_SCOPE`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateKey {
    pub scope: String,
    pub kind: KeyKind,
    pub id: String,
}

impl StateKey {
    /// Create a new state key.
    #[must_use]
    pub fn new(scope: impl Into<String>, kind: KeyKind, id: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            kind,
            id: id.into(),
        }
    }

    /// A key in the global scope.
    #[must_use]
    pub fn global(kind: KeyKind, id: impl Into<String>) -> Self {
        Self::new(GLOBAL_SCOPE, kind, id)
    }

    /// Return a canonical string representation: `scope:kind:id`
    #[must_use]
    pub fn canonical(&self) -> String {
        format!("{}:{}:{}", self.scope, self.kind, self.id)
    }
}

impl std::fmt::Display for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_kind_as_str() {
        assert_eq!(KeyKind::Credential.as_str(), "credential");
        assert_eq!(KeyKind::DigestIndex.as_str(), "digest_index");
        assert_eq!(KeyKind::QuotaWindow.as_str(), "quota_window");
        assert_eq!(KeyKind::NotificationMarker.as_str(), "notification_marker");
        assert_eq!(KeyKind::Custom("foo".into()).as_str(), "foo");
    }

    #[test]
    fn state_key_canonical() {
        let key = StateKey::new("ada@example.com", KeyKind::Rollup, "minute:29000000:calls");
        assert_eq!(
            key.canonical(),
            "ada@example.com:rollup:minute:29000000:calls"
        );
        assert_eq!(
            StateKey::global(KeyKind::Security, "x").to_string(),
            "global:security:x"
        );
    }
}
