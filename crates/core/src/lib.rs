pub mod credential;
pub mod decision;
pub mod digest;
pub mod event;
pub mod monitoring;
pub mod notification;
pub mod quota;
pub mod rollup;
pub mod subscription;
pub mod threshold;
pub mod types;

pub use credential::{Credential, CredentialStatus};
pub use decision::{AuthContext, Decision, DenyReason};
pub use digest::SecretDigest;
pub use event::{RequestMeta, UsageEvent, UsageEventKind};
pub use monitoring::{MemoryMetricsSink, MetricDatum, MetricUnit, MetricsSink, TracingMetricsSink};
pub use notification::{
    DEFAULT_EMAIL_THRESHOLDS, NotificationPreferences, ThresholdCrossing, ThresholdNotifier,
};
pub use quota::{
    QuotaDecision, QuotaGrant, QuotaPolicy, QuotaWindow, WindowState, aggregate_usage, decide,
};
pub use rollup::{Granularity, Rollup, RollupDelta, RollupScope};
pub use subscription::{
    SUSPEND_AFTER_FAILURES, SubscriptionStatus, WebhookEventType, WebhookSubscription,
};
pub use threshold::{THRESHOLD_LADDER, crossed};
pub use types::{CredentialId, PrincipalId, SubscriptionId};
