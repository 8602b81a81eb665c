use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand_core::{OsRng, RngCore};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, warn};

use meter_core::{
    NotificationPreferences, PrincipalId, SubscriptionId, WebhookEventType, WebhookSubscription,
};
use meter_state::{CasResult, KeyKind, StateKey, StateStore};
use meter_webhook::validate_endpoint;

use crate::error::DispatchError;

const PREFERENCES_ID: &str = "notifications";

/// Result of one delivery attempt, as recorded on the subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Failed(String),
}

fn subscription_key(principal: &PrincipalId, id: &SubscriptionId) -> StateKey {
    StateKey::new(principal.as_str(), KeyKind::Subscription, id.as_str())
}

fn preferences_key(principal: &PrincipalId) -> StateKey {
    StateKey::new(principal.as_str(), KeyKind::Preference, PREFERENCES_ID)
}

fn decode<T: DeserializeOwned>(key: &StateKey, raw: &str) -> Result<T, DispatchError> {
    serde_json::from_str(raw).map_err(|source| DispatchError::CorruptRecord {
        key: key.canonical(),
        source,
    })
}

fn encode<T: Serialize>(key: &StateKey, value: &T) -> Result<String, DispatchError> {
    serde_json::to_string(value).map_err(|source| DispatchError::CorruptRecord {
        key: key.canonical(),
        source,
    })
}

/// `whsec_` followed by 32 random bytes in hex.
fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    format!("whsec_{}", hex::encode(bytes))
}

/// Webhook subscriptions and notification preferences on a [`StateStore`].
#[derive(Clone)]
pub struct SubscriptionRepository {
    store: Arc<dyn StateStore>,
    allow_insecure: bool,
    max_update_attempts: u32,
}

impl SubscriptionRepository {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            allow_insecure: false,
            max_update_attempts: 8,
        }
    }

    /// Accept `http://` endpoints. Local testing only.
    #[must_use]
    pub fn allow_insecure_endpoints(mut self, allow: bool) -> Self {
        self.allow_insecure = allow;
        self
    }

    #[must_use]
    pub fn with_max_update_attempts(mut self, attempts: u32) -> Self {
        self.max_update_attempts = attempts.max(1);
        self
    }

    /// Create an active subscription with a fresh signing secret.
    #[instrument(skip_all, fields(principal = %principal))]
    pub async fn register(
        &self,
        principal: &PrincipalId,
        url: &str,
        event_types: Vec<WebhookEventType>,
    ) -> Result<WebhookSubscription, DispatchError> {
        validate_endpoint(url, self.allow_insecure)?;
        let event_types = if event_types.is_empty() {
            vec![WebhookEventType::All]
        } else {
            event_types
        };
        let subscription =
            WebhookSubscription::new(principal.clone(), url, event_types, generate_secret());
        let key = subscription_key(principal, &subscription.id);
        self.store
            .set(&key, &encode(&key, &subscription)?, None)
            .await?;
        info!(subscription_id = %subscription.id, "registered webhook subscription");
        Ok(subscription)
    }

    pub async fn get(
        &self,
        principal: &PrincipalId,
        id: &SubscriptionId,
    ) -> Result<Option<WebhookSubscription>, DispatchError> {
        let key = subscription_key(principal, id);
        match self.store.get(&key).await? {
            Some(raw) => Ok(Some(decode(&key, &raw)?)),
            None => Ok(None),
        }
    }

    /// Every subscription of `principal`, oldest first. Unreadable records
    /// are skipped.
    #[instrument(skip_all, fields(principal = %principal))]
    pub async fn list(&self, principal: &PrincipalId) -> Result<Vec<WebhookSubscription>, DispatchError> {
        let entries = self
            .store
            .scan_keys(principal.as_str(), KeyKind::Subscription, None)
            .await?;
        let mut subscriptions: Vec<WebhookSubscription> = entries
            .into_iter()
            .filter_map(|(key, raw)| match decode(&key, &raw) {
                Ok(sub) => Some(sub),
                Err(e) => {
                    warn!(error = %e, "skipping unreadable subscription");
                    None
                }
            })
            .collect();
        subscriptions.sort_by(|a: &WebhookSubscription, b| a.created_at.cmp(&b.created_at));
        Ok(subscriptions)
    }

    /// Apply a delivery outcome. Returns the updated record and whether this
    /// outcome suspended it, or `None` if the subscription was deleted.
    pub async fn record_outcome(
        &self,
        principal: &PrincipalId,
        id: &SubscriptionId,
        outcome: &DeliveryOutcome,
        suspend_after: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<(WebhookSubscription, bool)>, DispatchError> {
        let mut suspended = false;
        let updated = self
            .update(principal, id, |sub| {
                suspended = match outcome {
                    DeliveryOutcome::Delivered => {
                        sub.record_success(now);
                        false
                    }
                    DeliveryOutcome::Failed(reason) => sub.record_failure(reason.clone(), suspend_after),
                };
            })
            .await?;
        Ok(updated.map(|sub| (sub, suspended)))
    }

    /// Owner-initiated reactivation of a suspended subscription.
    #[instrument(skip_all, fields(principal = %principal, subscription_id = %id))]
    pub async fn reactivate(
        &self,
        principal: &PrincipalId,
        id: &SubscriptionId,
    ) -> Result<Option<WebhookSubscription>, DispatchError> {
        let updated = self.update(principal, id, WebhookSubscription::reactivate).await?;
        if updated.is_some() {
            info!("reactivated webhook subscription");
        }
        Ok(updated)
    }

    pub async fn delete(&self, principal: &PrincipalId, id: &SubscriptionId) -> Result<bool, DispatchError> {
        let removed = self.store.delete(&subscription_key(principal, id)).await?;
        debug!(principal = %principal, subscription_id = %id, removed, "deleted webhook subscription");
        Ok(removed)
    }

    pub async fn set_preferences(
        &self,
        principal: &PrincipalId,
        preferences: &NotificationPreferences,
    ) -> Result<(), DispatchError> {
        let key = preferences_key(principal);
        self.store.set(&key, &encode(&key, preferences)?, None).await?;
        Ok(())
    }

    /// Stored preferences, or the defaults when none were set.
    pub async fn preferences(&self, principal: &PrincipalId) -> Result<NotificationPreferences, DispatchError> {
        let key = preferences_key(principal);
        match self.store.get(&key).await? {
            Some(raw) => decode(&key, &raw),
            None => Ok(NotificationPreferences::default()),
        }
    }

    async fn update<F>(
        &self,
        principal: &PrincipalId,
        id: &SubscriptionId,
        mut mutate: F,
    ) -> Result<Option<WebhookSubscription>, DispatchError>
    where
        F: FnMut(&mut WebhookSubscription) + Send,
    {
        let key = subscription_key(principal, id);
        for _ in 0..self.max_update_attempts {
            let Some((raw, version)) = self.store.get_versioned(&key).await? else {
                return Ok(None);
            };
            let mut subscription: WebhookSubscription = decode(&key, &raw)?;
            mutate(&mut subscription);
            match self
                .store
                .compare_and_swap(&key, version, &encode(&key, &subscription)?, None)
                .await?
            {
                CasResult::Ok => return Ok(Some(subscription)),
                CasResult::Conflict {
                    current_version: 0, ..
                } => return Ok(None),
                CasResult::Conflict { .. } => {}
            }
        }
        Err(DispatchError::Contention {
            key: key.canonical(),
            attempts: self.max_update_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use meter_core::SubscriptionStatus;
    use meter_state_memory::MemoryStateStore;
    use meter_webhook::WebhookError;

    use super::*;

    fn repo() -> SubscriptionRepository {
        SubscriptionRepository::new(Arc::new(MemoryStateStore::new()))
    }

    fn ada() -> PrincipalId {
        PrincipalId::from("ada@example.com")
    }

    #[tokio::test]
    async fn register_requires_https_and_generates_secret() {
        let repo = repo();
        let err = repo
            .register(&ada(), "http://hooks.example.com", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Webhook(WebhookError::InsecureUrl(_))));

        let sub = repo
            .register(&ada(), "https://hooks.example.com", vec![])
            .await
            .unwrap();
        assert!(sub.secret.starts_with("whsec_"));
        assert_eq!(sub.secret.len(), "whsec_".len() + 64);
        assert_eq!(sub.event_types, vec![WebhookEventType::All]);

        let other = repo
            .register(&ada(), "https://hooks.example.com/2", vec![WebhookEventType::QuotaExhausted])
            .await
            .unwrap();
        assert_ne!(sub.secret, other.secret);
        assert_eq!(repo.list(&ada()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn suspends_on_fifth_failure_and_recovers() {
        let repo = repo();
        let sub = repo
            .register(&ada(), "https://hooks.example.com", vec![])
            .await
            .unwrap();
        let now = Utc::now();
        for attempt in 1..=5 {
            let (updated, suspended) = repo
                .record_outcome(&ada(), &sub.id, &DeliveryOutcome::Failed("HTTP 500".into()), 5, now)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(updated.consecutive_failures, attempt);
            assert_eq!(suspended, attempt == 5);
        }
        let stored = repo.get(&ada(), &sub.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Suspended);

        repo.reactivate(&ada(), &sub.id).await.unwrap().unwrap();
        let (updated, _) = repo
            .record_outcome(&ada(), &sub.id, &DeliveryOutcome::Delivered, 5, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, SubscriptionStatus::Active);
        assert_eq!(updated.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn outcome_for_deleted_subscription_is_none() {
        let repo = repo();
        let sub = repo
            .register(&ada(), "https://hooks.example.com", vec![])
            .await
            .unwrap();
        assert!(repo.delete(&ada(), &sub.id).await.unwrap());
        let outcome = repo
            .record_outcome(&ada(), &sub.id, &DeliveryOutcome::Delivered, 5, Utc::now())
            .await
            .unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn preferences_default_then_stored() {
        let repo = repo();
        assert_eq!(repo.preferences(&ada()).await.unwrap(), NotificationPreferences::default());
        let prefs = NotificationPreferences {
            email_enabled: true,
            thresholds: Some(vec![95]),
        };
        repo.set_preferences(&ada(), &prefs).await.unwrap();
        assert_eq!(repo.preferences(&ada()).await.unwrap(), prefs);
    }
}
