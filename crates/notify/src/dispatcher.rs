use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, error, info, instrument, warn};

use meter_core::{
    NotificationPreferences, SubscriptionId, ThresholdCrossing, ThresholdNotifier,
    WebhookSubscription,
};
use meter_email::{EmailBackend, EmailMessage};
use meter_state::{KeyKind, StateKey, StateStore};
use meter_webhook::{WebhookDelivery, WebhookTransport};

use crate::config::DispatcherConfig;
use crate::error::DispatchError;
use crate::metrics::DispatcherMetrics;
use crate::payload::webhook_payload;
use crate::subscriptions::{DeliveryOutcome, SubscriptionRepository};
use crate::templates::EmailTemplates;

/// Outcome of one webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookAttempt {
    pub subscription_id: SubscriptionId,
    pub delivered: bool,
    /// This attempt suspended the subscription.
    pub suspended: bool,
}

/// What happened to one crossing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Already notified in this window; nothing was sent.
    pub duplicate: bool,
    pub webhooks: Vec<WebhookAttempt>,
    pub email_sent: bool,
}

impl DispatchReport {
    pub fn delivered(&self) -> usize {
        self.webhooks.iter().filter(|a| a.delivered).count()
    }
}

fn marker_key(crossing: &ThresholdCrossing) -> StateKey {
    StateKey::new(
        crossing.principal.as_str(),
        KeyKind::NotificationMarker,
        format!("{}:{}", crossing.reset_at.timestamp(), crossing.threshold),
    )
}

/// Fans threshold crossings out to webhooks and email.
pub struct NotificationDispatcher {
    store: Arc<dyn StateStore>,
    subscriptions: SubscriptionRepository,
    transport: Arc<dyn WebhookTransport>,
    email: Option<Arc<dyn EmailBackend>>,
    templates: EmailTemplates,
    config: DispatcherConfig,
    metrics: Arc<DispatcherMetrics>,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn StateStore>,
        subscriptions: SubscriptionRepository,
        transport: Arc<dyn WebhookTransport>,
        config: DispatcherConfig,
        metrics: Arc<DispatcherMetrics>,
    ) -> Result<Self, DispatchError> {
        Ok(Self {
            store,
            subscriptions,
            transport,
            email: None,
            templates: EmailTemplates::new()?,
            config,
            metrics,
        })
    }

    #[must_use]
    pub fn with_email(mut self, backend: Arc<dyn EmailBackend>) -> Self {
        self.email = Some(backend);
        self
    }

    /// Name of the attached mail backend, if threshold email is on.
    pub fn email_backend_name(&self) -> Option<&'static str> {
        self.email.as_ref().map(|backend| backend.backend_name())
    }

    pub fn subscriptions(&self) -> &SubscriptionRepository {
        &self.subscriptions
    }

    pub fn metrics(&self) -> &Arc<DispatcherMetrics> {
        &self.metrics
    }

    /// Notify everyone interested in `crossing`, at most once per window.
    ///
    /// Only a failure to claim the crossing is returned; delivery failures
    /// are recorded on the subscription and reported.
    #[instrument(skip_all, fields(principal = %crossing.principal, threshold = crossing.threshold))]
    pub async fn dispatch(&self, crossing: &ThresholdCrossing) -> Result<DispatchReport, DispatchError> {
        DispatcherMetrics::incr(&self.metrics.crossings);
        let now = Utc::now();
        if !self.claim(crossing, now).await? {
            DispatcherMetrics::incr(&self.metrics.duplicates_suppressed);
            debug!("crossing already notified in this window");
            return Ok(DispatchReport {
                duplicate: true,
                ..DispatchReport::default()
            });
        }

        let (webhooks, email_sent) =
            tokio::join!(self.deliver_webhooks(crossing, now), self.send_email(crossing));
        let report = DispatchReport {
            duplicate: false,
            webhooks,
            email_sent,
        };
        info!(
            webhooks = report.webhooks.len(),
            delivered = report.delivered(),
            email_sent = report.email_sent,
            "threshold notification dispatched"
        );
        Ok(report)
    }

    /// Claim the `(principal, window, threshold)` marker. Expires with the
    /// window.
    async fn claim(&self, crossing: &ThresholdCrossing, now: DateTime<Utc>) -> Result<bool, DispatchError> {
        let ttl = (crossing.reset_at - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .max(Duration::from_secs(1));
        let claimed = self
            .store
            .check_and_set(&marker_key(crossing), &now.to_rfc3339(), Some(ttl))
            .await
            .inspect_err(|_| DispatcherMetrics::incr(&self.metrics.store_errors))?;
        Ok(claimed)
    }

    async fn deliver_webhooks(&self, crossing: &ThresholdCrossing, now: DateTime<Utc>) -> Vec<WebhookAttempt> {
        let subscriptions = match self.subscriptions.list(&crossing.principal).await {
            Ok(subs) => subs,
            Err(e) => {
                DispatcherMetrics::incr(&self.metrics.store_errors);
                error!(error = %e, "failed to list webhook subscriptions");
                return Vec::new();
            }
        };
        let event_type = crossing.event_type();
        let targets: Vec<WebhookSubscription> = subscriptions
            .into_iter()
            .filter(|s| s.accepts(event_type))
            .collect();
        if targets.is_empty() {
            return Vec::new();
        }

        let event_id = uuid::Uuid::new_v4().to_string();
        let payload = webhook_payload(crossing, &event_id, now);
        join_all(
            targets
                .iter()
                .map(|sub| self.deliver_one(sub, &payload, now)),
        )
        .await
    }

    /// Deliver to a single subscriber and record the outcome on it.
    async fn deliver_one(
        &self,
        subscription: &WebhookSubscription,
        payload: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> WebhookAttempt {
        let result = self.post(subscription, payload, now).await;
        let outcome = match &result {
            Ok(()) => {
                DispatcherMetrics::incr(&self.metrics.webhooks_delivered);
                DeliveryOutcome::Delivered
            }
            Err(e) => {
                DispatcherMetrics::incr(&self.metrics.webhooks_failed);
                warn!(subscription_id = %subscription.id, error = %e, "webhook delivery failed");
                DeliveryOutcome::Failed(e.failure_reason())
            }
        };

        let suspended = match self
            .subscriptions
            .record_outcome(
                &subscription.principal,
                &subscription.id,
                &outcome,
                self.config.suspend_after,
                Utc::now(),
            )
            .await
        {
            Ok(Some((_, true))) => {
                DispatcherMetrics::incr(&self.metrics.subscriptions_suspended);
                warn!(subscription_id = %subscription.id, "webhook subscription suspended");
                true
            }
            Ok(_) => false,
            Err(e) => {
                DispatcherMetrics::incr(&self.metrics.store_errors);
                error!(subscription_id = %subscription.id, error = %e, "failed to record delivery outcome");
                false
            }
        };

        WebhookAttempt {
            subscription_id: subscription.id.clone(),
            delivered: result.is_ok(),
            suspended,
        }
    }

    async fn post(
        &self,
        subscription: &WebhookSubscription,
        payload: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), DispatchError> {
        let delivery = WebhookDelivery::new(&subscription.url, &subscription.secret, payload, now.timestamp())?;
        tokio::time::timeout(self.config.webhook_timeout, self.transport.deliver(&delivery))
            .await
            .map_err(|_| DispatchError::Timeout(self.config.webhook_timeout))??;
        Ok(())
    }

    /// Email the principal if enabled and wanted. Returns whether a message
    /// went out.
    async fn send_email(&self, crossing: &ThresholdCrossing) -> bool {
        let Some(backend) = self.email.as_ref().filter(|_| self.config.email_enabled) else {
            return false;
        };
        let preferences = match self.subscriptions.preferences(&crossing.principal).await {
            Ok(p) => p,
            Err(e) => {
                DispatcherMetrics::incr(&self.metrics.store_errors);
                warn!(error = %e, "failed to read notification preferences, using defaults");
                NotificationPreferences::default()
            }
        };
        if !preferences.wants_email(crossing.threshold) {
            DispatcherMetrics::incr(&self.metrics.emails_skipped);
            return false;
        }

        match self.email_once(backend.as_ref(), crossing).await {
            Ok(()) => {
                DispatcherMetrics::incr(&self.metrics.emails_sent);
                true
            }
            Err(e) => {
                DispatcherMetrics::incr(&self.metrics.emails_failed);
                warn!(error = %e, "threshold email failed");
                false
            }
        }
    }

    async fn email_once(&self, backend: &dyn EmailBackend, crossing: &ThresholdCrossing) -> Result<(), DispatchError> {
        let rendered = self.templates.render(crossing)?;
        let message = EmailMessage::new(
            self.config.from_address.clone(),
            crossing.principal.as_str(),
            rendered.subject,
        )
        .with_text(rendered.text)
        .with_html(rendered.html);
        backend.send(&message).await?;
        Ok(())
    }
}

#[async_trait]
impl ThresholdNotifier for NotificationDispatcher {
    async fn notify(&self, crossing: &ThresholdCrossing) {
        if let Err(e) = self.dispatch(crossing).await {
            error!(principal = %crossing.principal, threshold = crossing.threshold, error = %e, "threshold notification skipped");
        }
    }
}
