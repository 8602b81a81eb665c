use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::SecretDigest;
use crate::types::{CredentialId, PrincipalId};

/// Lifecycle status of a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Active,
    Suspended,
    Expired,
}

impl CredentialStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A caller credential owned by a principal.
///
/// `usage_count` only counts toward the quota window identified by
/// `window_seq`; a credential stamped with an older sequence has zero usage in
/// the current window, see [`Credential::usage_in_window`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: CredentialId,
    pub principal: PrincipalId,
    pub digest: SecretDigest,
    pub name: String,
    pub status: CredentialStatus,
    #[serde(default)]
    pub usage_count: u64,
    /// Quota window this credential's counter belongs to.
    #[serde(default)]
    pub window_seq: u64,
    #[serde(default)]
    pub reset_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Credential {
    /// Create a new active credential with zero usage.
    #[must_use]
    pub fn new(principal: PrincipalId, name: impl Into<String>, digest: SecretDigest) -> Self {
        Self {
            id: CredentialId::generate(),
            principal,
            digest,
            name: name.into(),
            status: CredentialStatus::Active,
            usage_count: 0,
            window_seq: 0,
            reset_at: None,
            last_used_at: None,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == CredentialStatus::Active
    }

    /// Usage attributable to window `seq`.
    #[must_use]
    pub fn usage_in_window(&self, seq: u64) -> u64 {
        if self.window_seq == seq {
            self.usage_count
        } else {
            0
        }
    }

    /// Record one more call in window `seq`, moving the counter into that
    /// window first if it belongs to an older one.
    pub fn record_call(&mut self, seq: u64, reset_at: DateTime<Utc>, now: DateTime<Utc>) {
        if self.window_seq < seq {
            self.window_seq = seq;
            self.usage_count = 0;
            self.reset_at = Some(reset_at);
        }
        self.usage_count += 1;
        self.last_used_at = Some(now);
    }

    /// Zero the counter and stamp it into window `seq`.
    ///
    /// Returns `false` without touching the record when it already belongs
    /// to `seq` or a newer window.
    pub fn reset_into(&mut self, seq: u64, reset_at: DateTime<Utc>) -> bool {
        if self.window_seq >= seq {
            return false;
        }
        self.window_seq = seq;
        self.usage_count = 0;
        self.reset_at = Some(reset_at);
        true
    }
}
