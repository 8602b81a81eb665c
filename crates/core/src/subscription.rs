use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{PrincipalId, SubscriptionId};

/// Consecutive delivery failures after which a subscription is suspended.
pub const SUSPEND_AFTER_FAILURES: u32 = 5;

/// Lifecycle status of a webhook subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    /// Stopped after repeated delivery failures; needs manual reactivation.
    Suspended,
}

/// Event types a subscriber can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WebhookEventType {
    /// A usage threshold below 100% was crossed.
    #[serde(rename = "usage.threshold")]
    UsageThreshold,
    /// The 100% threshold was crossed; further calls are denied.
    #[serde(rename = "usage.exhausted")]
    QuotaExhausted,
    /// Every event type.
    #[serde(rename = "*")]
    All,
}

impl WebhookEventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UsageThreshold => "usage.threshold",
            Self::QuotaExhausted => "usage.exhausted",
            Self::All => "*",
        }
    }
}

/// A principal-owned webhook endpoint.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: SubscriptionId,
    pub principal: PrincipalId,
    pub url: String,
    pub event_types: Vec<WebhookEventType>,
    /// Per-subscription HMAC signing secret.
    pub secret: String,
    pub status: SubscriptionStatus,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_delivery_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_failure: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for WebhookSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSubscription")
            .field("id", &self.id)
            .field("principal", &self.principal)
            .field("url", &self.url)
            .field("event_types", &self.event_types)
            .field("secret", &"[redacted]")
            .field("status", &self.status)
            .field("consecutive_failures", &self.consecutive_failures)
            .finish_non_exhaustive()
    }
}

impl WebhookSubscription {
    #[must_use]
    pub fn new(
        principal: PrincipalId,
        url: impl Into<String>,
        event_types: Vec<WebhookEventType>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            id: SubscriptionId::generate(),
            principal,
            url: url.into(),
            event_types,
            secret: secret.into(),
            status: SubscriptionStatus::Active,
            consecutive_failures: 0,
            last_delivery_at: None,
            last_failure: None,
            created_at: Utc::now(),
        }
    }

    /// Whether this subscription should receive `event`.
    #[must_use]
    pub fn accepts(&self, event: WebhookEventType) -> bool {
        self.status == SubscriptionStatus::Active
            && self
                .event_types
                .iter()
                .any(|t| *t == event || *t == WebhookEventType::All)
    }

    /// A 2xx delivery: reset the failure streak and mark active.
    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.consecutive_failures = 0;
        self.status = SubscriptionStatus::Active;
        self.last_delivery_at = Some(now);
        self.last_failure = None;
    }

    /// A failed delivery. Returns `true` if this failure suspended the
    /// subscription.
    pub fn record_failure(&mut self, reason: impl Into<String>, suspend_after: u32) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure = Some(reason.into());
        if self.status == SubscriptionStatus::Active && self.consecutive_failures >= suspend_after
        {
            self.status = SubscriptionStatus::Suspended;
            return true;
        }
        false
    }

    /// Manual reactivation by the owner. The failure streak is kept until the
    /// next successful delivery clears it.
    pub fn reactivate(&mut self) {
        self.status = SubscriptionStatus::Active;
    }
}
