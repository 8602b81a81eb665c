use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::subscription::WebhookEventType;
use crate::types::{CredentialId, PrincipalId};

/// Email thresholds used when a principal has not stored a preference.
pub const DEFAULT_EMAIL_THRESHOLDS: [u8; 3] = [50, 75, 90];

/// A principal's usage just crossed a threshold. Derived, never the source of
/// truth for usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdCrossing {
    pub principal: PrincipalId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<CredentialId>,
    pub threshold: u8,
    pub usage: u64,
    pub limit: u64,
    /// End of the window the crossing belongs to.
    pub reset_at: DateTime<Utc>,
}

impl ThresholdCrossing {
    /// Webhook event type for this crossing.
    #[must_use]
    pub fn event_type(&self) -> WebhookEventType {
        if self.threshold >= 100 {
            WebhookEventType::QuotaExhausted
        } else {
            WebhookEventType::UsageThreshold
        }
    }

    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.usage)
    }
}

/// A principal's email notification preference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPreferences {
    #[serde(default = "default_true")]
    pub email_enabled: bool,
    /// Explicit threshold list; `None` means [`DEFAULT_EMAIL_THRESHOLDS`].
    #[serde(default)]
    pub thresholds: Option<Vec<u8>>,
}

fn default_true() -> bool {
    true
}

impl Default for NotificationPreferences {
    fn default() -> Self {
        Self {
            email_enabled: true,
            thresholds: None,
        }
    }
}

impl NotificationPreferences {
    /// Whether a crossing of `threshold` should be emailed.
    #[must_use]
    pub fn wants_email(&self, threshold: u8) -> bool {
        if !self.email_enabled {
            return false;
        }
        match &self.thresholds {
            Some(list) => list.contains(&threshold),
            None => DEFAULT_EMAIL_THRESHOLDS.contains(&threshold),
        }
    }
}

/// Receiver of threshold crossings. Implementations must never propagate
/// delivery failures back to the caller.
#[async_trait]
pub trait ThresholdNotifier: Send + Sync {
    async fn notify(&self, crossing: &ThresholdCrossing);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crossing(threshold: u8) -> ThresholdCrossing {
        ThresholdCrossing {
            principal: PrincipalId::from("ada@example.com"),
            credential_id: None,
            threshold,
            usage: u64::from(threshold),
            limit: 100,
            reset_at: Utc::now(),
        }
    }

    #[test]
    fn event_type_depends_on_threshold() {
        assert_eq!(crossing(95).event_type(), WebhookEventType::UsageThreshold);
        assert_eq!(crossing(100).event_type(), WebhookEventType::QuotaExhausted);
        assert_eq!(crossing(80).remaining(), 20);
    }

    #[test]
    fn default_preferences_email_at_50_75_90() {
        let prefs = NotificationPreferences::default();
        assert!(prefs.wants_email(50));
        assert!(prefs.wants_email(90));
        assert!(!prefs.wants_email(80));
        assert!(!prefs.wants_email(100));
    }

    #[test]
    fn explicit_list_and_opt_out() {
        let prefs = NotificationPreferences {
            email_enabled: true,
            thresholds: Some(vec![100]),
        };
        assert!(prefs.wants_email(100));
        assert!(!prefs.wants_email(50));

        let off = NotificationPreferences {
            email_enabled: false,
            thresholds: None,
        };
        assert!(!off.wants_email(50));
    }

    #[test]
    fn preferences_deserialize_with_defaults() {
        let prefs: NotificationPreferences = serde_json::from_str("{}").unwrap();
        assert_eq!(prefs, NotificationPreferences::default());
    }
}
