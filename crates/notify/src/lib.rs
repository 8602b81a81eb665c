//! Notification dispatch for threshold crossings.
//!
//! A crossing is claimed once per `(principal, window, threshold)`, then
//! fanned out to every matching webhook subscription and, when the
//! principal's preferences ask for it, to email. Webhook and email paths run
//! concurrently and never fail each other; each subscriber is delivered to
//! in isolation and suspended after repeated failures.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod payload;
pub mod subscriptions;
pub mod templates;

pub use config::DispatcherConfig;
pub use dispatcher::{DispatchReport, NotificationDispatcher, WebhookAttempt};
pub use error::DispatchError;
pub use metrics::{DispatcherMetrics, DispatcherMetricsSnapshot};
pub use payload::webhook_payload;
pub use subscriptions::{DeliveryOutcome, SubscriptionRepository};
pub use templates::{EmailTemplates, RenderedEmail};
