//! End-to-end scenarios against a fully wired in-memory pipeline.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use meter_authorizer::AuthRequest;
use meter_core::{
    DenyReason, Granularity, PrincipalId, RequestMeta, SubscriptionStatus, UsageEvent,
    UsageEventKind,
};
use meter_email::MemoryEmailBackend;
use meter_server::config::MeterConfig;
use meter_server::pipeline::Pipeline;
use meter_state::{CasResult, KeyKind, StateError, StateKey, StateStore};
use meter_state_memory::MemoryStateStore;
use meter_stream::EventProducer;
use meter_webhook::{WebhookDelivery, WebhookError, WebhookResponse, WebhookTransport};
use parking_lot::Mutex;

const HOOK: &str = "https://hooks.example.com/usage";

/// Records deliveries; URLs in `failing` answer 500.
#[derive(Default)]
struct RecordingTransport {
    delivered: Mutex<Vec<WebhookDelivery>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingTransport {
    fn thresholds(&self) -> Vec<u64> {
        self.delivered
            .lock()
            .iter()
            .map(|d| {
                let body: serde_json::Value = serde_json::from_slice(&d.body).unwrap();
                body["data"]["threshold"].as_u64().unwrap()
            })
            .collect()
    }
}

#[async_trait]
impl WebhookTransport for RecordingTransport {
    async fn deliver(&self, delivery: &WebhookDelivery) -> Result<WebhookResponse, WebhookError> {
        if self.failing.lock().contains(&delivery.url) {
            return Err(WebhookError::UnexpectedStatus {
                status: 500,
                body: "boom".into(),
            });
        }
        self.delivered.lock().push(delivery.clone());
        Ok(WebhookResponse {
            status_code: 200,
            body: String::new(),
        })
    }
}

struct Harness {
    pipeline: Pipeline,
    transport: Arc<RecordingTransport>,
    email: Arc<MemoryEmailBackend>,
}

const BASE_CONFIG: &str = r#"
[aggregator]
poll_interval_ms = 10
batch_size = 500

[dispatcher]
email_enabled = true

[email]
backend = "memory"

[cache]
maintenance_interval_seconds = 0
"#;

fn harness_with(extra: &str, store: Option<Arc<dyn StateStore>>) -> Harness {
    let config = MeterConfig::from_toml(&format!("{BASE_CONFIG}\n{extra}")).unwrap();
    let transport = Arc::new(RecordingTransport::default());
    let email = Arc::new(MemoryEmailBackend::new());
    let mut builder = Pipeline::builder(config)
        .webhook_transport(transport.clone())
        .email_backend(email.clone());
    if let Some(store) = store {
        builder = builder.state_store(store);
    }
    Harness {
        pipeline: builder.build().unwrap(),
        transport,
        email,
    }
}

fn harness(extra: &str) -> Harness {
    harness_with(extra, None)
}

fn ada() -> PrincipalId {
    PrincipalId::from("ada@example.com")
}

fn req(secret: &str) -> AuthRequest {
    AuthRequest::new(secret, "GET", "/v1/deadlines").with_source_ip("203.0.113.7")
}

/// Poll `check` until it holds or five seconds pass.
async fn eventually<F: FnMut() -> bool>(what: &str, mut check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn append(h: &Harness, event: &UsageEvent) {
    h.pipeline
        .stream
        .append(event.partition_key(), event.encode().unwrap())
        .await
        .unwrap();
}

fn crossing_event(threshold: u8, usage: u64, limit: u64, window_days: i64) -> UsageEvent {
    UsageEvent::new(
        UsageEventKind::ThresholdCrossed {
            threshold,
            usage,
            limit,
            reset_at: Utc::now() + TimeDelta::days(window_days),
        },
        Some(ada()),
        None,
        RequestMeta::default(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn siblings_share_the_last_call_of_the_quota() {
    let h = harness("");
    h.pipeline
        .dispatcher
        .as_ref()
        .unwrap()
        .subscriptions()
        .register(&ada(), HOOK, vec![])
        .await
        .unwrap();

    let authorizer = &h.pipeline.authorizer;
    let repo = authorizer.repository();
    let a = repo.create_credential(&ada(), "ci", "sk_a").await.unwrap();
    let b = repo.create_credential(&ada(), "laptop", "sk_b").await.unwrap();

    // Opens the window; then bring the pair to 9,999 calls.
    assert!(authorizer.authorize(&req("sk_a")).await.is_allowed());
    let mut a = repo.get(&ada(), &a.id).await.unwrap().unwrap();
    a.usage_count = 5_000;
    repo.put_credential(&a).await.unwrap();
    let mut b = repo.get(&ada(), &b.id).await.unwrap().unwrap();
    b.window_seq = a.window_seq;
    b.reset_at = a.reset_at;
    b.usage_count = 4_999;
    repo.put_credential(&b).await.unwrap();

    let last = authorizer.authorize(&req("sk_b")).await;
    let ctx = last.context().unwrap();
    assert_eq!(ctx.usage_count, 10_000);
    assert_eq!(ctx.remaining_calls, 0);
    assert_eq!(ctx.to_context_map()["remainingCalls"], "0");
    assert_eq!(ctx.credential_name, "laptop");

    for secret in ["sk_a", "sk_b"] {
        let denied = authorizer.authorize(&req(secret)).await;
        assert_eq!(denied.deny_reason(), Some(DenyReason::QuotaExceeded));
        assert_eq!(denied.public_message(), Some("Unauthorized"));
    }
    let a = repo.get(&ada(), &a.id).await.unwrap().unwrap();
    let b = repo.get(&ada(), &b.id).await.unwrap().unwrap();
    assert_eq!(a.usage_count + b.usage_count, 10_000);

    // The 100% crossing reaches the subscriber once.
    eventually("exhausted webhook", || h.transport.delivered.lock().len() == 1).await;
    assert_eq!(h.transport.thresholds(), vec![100]);

    // Both denials are kept for forensics.
    let queries = &h.pipeline.queries;
    let mut records = Vec::new();
    for _ in 0..200 {
        records = queries.rate_limited_records(&ada(), 10).await.unwrap();
        if records.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.usage == 10_000 && r.limit == 10_000));

    h.pipeline.shutdown().await.unwrap();
}

/// Deletes the credential right after the authorizer reads it for the
/// increment.
struct DeleteOnIncrement {
    inner: MemoryStateStore,
    armed: AtomicBool,
}

#[async_trait]
impl StateStore for DeleteOnIncrement {
    async fn check_and_set(
        &self,
        key: &StateKey,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StateError> {
        self.inner.check_and_set(key, value, ttl).await
    }

    async fn get(&self, key: &StateKey) -> Result<Option<String>, StateError> {
        self.inner.get(key).await
    }

    async fn get_versioned(&self, key: &StateKey) -> Result<Option<(String, u64)>, StateError> {
        let value = self.inner.get_versioned(key).await?;
        if key.kind == KeyKind::Credential && self.armed.swap(false, Ordering::SeqCst) {
            self.inner.delete(key).await?;
        }
        Ok(value)
    }

    async fn set(
        &self,
        key: &StateKey,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StateError> {
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &StateKey) -> Result<bool, StateError> {
        self.inner.delete(key).await
    }

    async fn increment(
        &self,
        key: &StateKey,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, StateError> {
        self.inner.increment(key, delta, ttl).await
    }

    async fn compare_and_swap(
        &self,
        key: &StateKey,
        expected_version: u64,
        new_value: &str,
        ttl: Option<Duration>,
    ) -> Result<CasResult, StateError> {
        self.inner
            .compare_and_swap(key, expected_version, new_value, ttl)
            .await
    }

    async fn scan_keys(
        &self,
        scope: &str,
        kind: KeyKind,
        prefix: Option<&str>,
    ) -> Result<Vec<(StateKey, String)>, StateError> {
        self.inner.scan_keys(scope, kind, prefix).await
    }
}

#[tokio::test]
async fn deletion_between_cache_fill_and_increment_denies() {
    let store = Arc::new(DeleteOnIncrement {
        inner: MemoryStateStore::new(),
        armed: AtomicBool::new(false),
    });
    let h = harness_with("", Some(store.clone()));
    let authorizer = &h.pipeline.authorizer;
    authorizer
        .repository()
        .create_credential(&ada(), "ci", "sk_del")
        .await
        .unwrap();

    assert!(authorizer.authorize(&req("sk_del")).await.is_allowed());
    store.armed.store(true, Ordering::SeqCst);

    let decision = authorizer.authorize(&req("sk_del")).await;
    assert_eq!(decision.deny_reason(), Some(DenyReason::InvalidCredential));
    assert_eq!(decision.public_message(), Some("Unauthorized"));

    // The stale cache entry is gone too.
    let again = authorizer.authorize(&req("sk_del")).await;
    assert_eq!(again.deny_reason(), Some(DenyReason::InvalidCredential));

    h.pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn deletion_invalidates_every_cache() {
    let h = harness("");
    let authorizer = &h.pipeline.authorizer;
    let repo = authorizer.repository();
    let cred = repo.create_credential(&ada(), "ci", "sk_inv").await.unwrap();
    assert!(authorizer.authorize(&req("sk_inv")).await.is_allowed());
    assert!(authorizer.cache().get(&cred.digest).await.is_some());

    repo.delete_credential(&ada(), &cred.id).await.unwrap();
    for _ in 0..200 {
        if authorizer.cache().get(&cred.digest).await.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(authorizer.cache().get(&cred.digest).await.is_none());
    assert!(authorizer.metrics().snapshot().invalidations_applied >= 1);

    h.pipeline.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_deliveries_are_aggregated_once() {
    let h = harness("");
    let authorizer = &h.pipeline.authorizer;
    let cred = authorizer
        .repository()
        .create_credential(&ada(), "ci", "sk_dup")
        .await
        .unwrap();
    assert!(authorizer.authorize(&req("sk_dup")).await.is_allowed());

    let replayed = UsageEvent::new(
        UsageEventKind::ApiCall { success: true },
        Some(ada()),
        Some(cred.id.clone()),
        RequestMeta::default(),
    );
    for _ in 0..10_000 {
        append(&h, &replayed).await;
    }

    let metrics = h.pipeline.aggregator.metrics().clone();
    let stream = h.pipeline.stream.clone();
    eventually("stream drained", || {
        metrics.snapshot().records >= 10_001 && stream.backlog() == 0
    })
    .await;

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.duplicates, 9_999);
    assert_eq!(snapshot.processed, 2);

    let now = Utc::now();
    let days = h
        .pipeline
        .queries
        .principal_summary(&ada(), Granularity::Day, now - TimeDelta::hours(1), now)
        .await
        .unwrap();
    let calls: u64 = days.iter().map(|r| r.calls).sum();
    assert_eq!(calls, 2);

    // Billing never reads the stream.
    let stored = authorizer
        .repository()
        .get(&ada(), &cred.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.usage_count, 1);

    h.pipeline.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn expired_window_resets_once_for_all_siblings() {
    let h = harness(
        r"
        [authorizer]
        quota_limit = 1000
        window = { custom = { seconds = 1 } }
        ",
    );
    let authorizer = h.pipeline.authorizer.clone();
    let repo = authorizer.repository();
    let a = repo.create_credential(&ada(), "a", "sk_ra").await.unwrap();
    let b = repo.create_credential(&ada(), "b", "sk_rb").await.unwrap();
    for secret in ["sk_ra", "sk_ra", "sk_rb"] {
        assert!(authorizer.authorize(&req(secret)).await.is_allowed());
    }

    tokio::time::sleep(Duration::from_millis(1_100)).await;

    let mut handles = Vec::new();
    for i in 0..20 {
        let authorizer = authorizer.clone();
        let secret = if i % 2 == 0 { "sk_ra" } else { "sk_rb" };
        handles.push(tokio::spawn(async move {
            authorizer.authorize(&req(secret)).await.is_allowed()
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap());
    }

    let a = repo.get(&ada(), &a.id).await.unwrap().unwrap();
    let b = repo.get(&ada(), &b.id).await.unwrap().unwrap();
    assert_eq!(a.window_seq, 2);
    assert_eq!(b.window_seq, 2);
    assert_eq!(a.reset_at, b.reset_at);
    assert_eq!(a.usage_count + b.usage_count, 20);

    drop(authorizer);
    h.pipeline.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn threshold_notifies_once_per_window() {
    let h = harness(
        r"
        [authorizer]
        quota_limit = 10
        ",
    );
    let dispatcher = h.pipeline.dispatcher.clone().unwrap();
    dispatcher
        .subscriptions()
        .register(&ada(), HOOK, vec![])
        .await
        .unwrap();
    let authorizer = &h.pipeline.authorizer;
    let repo = authorizer.repository();
    repo.create_credential(&ada(), "a", "sk_ta").await.unwrap();
    repo.create_credential(&ada(), "b", "sk_tb").await.unwrap();

    let mut reset_at = None;
    for i in 0..5 {
        let secret = if i % 2 == 0 { "sk_ta" } else { "sk_tb" };
        let decision = authorizer.authorize(&req(secret)).await;
        reset_at = Some(decision.context().unwrap().usage_reset_date);
    }

    eventually("50% webhook", || h.transport.delivered.lock().len() == 1).await;
    assert_eq!(h.transport.thresholds(), vec![50]);
    eventually("50% email", || h.email.sent().len() == 1).await;
    assert_eq!(h.email.sent()[0].to, "ada@example.com");

    // A sibling reporting the same crossing in the same window.
    let duplicate = UsageEvent::new(
        UsageEventKind::ThresholdCrossed {
            threshold: 50,
            usage: 5,
            limit: 10,
            reset_at: reset_at.unwrap(),
        },
        Some(ada()),
        None,
        RequestMeta::default(),
    );
    append(&h, &duplicate).await;
    eventually("duplicate suppressed", || {
        dispatcher.metrics().snapshot().duplicates_suppressed == 1
    })
    .await;
    assert_eq!(h.transport.delivered.lock().len(), 1);
    assert_eq!(h.email.sent().len(), 1);

    h.pipeline.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_subscription_suspends_at_fifth_failure_and_recovers() {
    let h = harness("");
    let dispatcher = h.pipeline.dispatcher.clone().unwrap();
    let subscriptions = dispatcher.subscriptions();
    let sub = subscriptions.register(&ada(), HOOK, vec![]).await.unwrap();
    h.transport.failing.lock().insert(HOOK.to_owned());

    // Each crossing belongs to its own window, so none is a duplicate.
    let stream = h.pipeline.stream.clone();
    for day in 1..=4 {
        append(&h, &crossing_event(80, 8_000, 10_000, day)).await;
        eventually("failed delivery", || {
            dispatcher.metrics().snapshot().crossings == u64::try_from(day).unwrap()
                && stream.backlog() == 0
        })
        .await;
    }
    let current = subscriptions.get(&ada(), &sub.id).await.unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::Active);
    assert_eq!(current.consecutive_failures, 4);

    append(&h, &crossing_event(80, 8_000, 10_000, 5)).await;
    eventually("suspension", || {
        dispatcher.metrics().snapshot().crossings == 5 && stream.backlog() == 0
    })
    .await;
    let current = subscriptions.get(&ada(), &sub.id).await.unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::Suspended);
    assert_eq!(current.last_failure.as_deref(), Some("HTTP 500"));
    assert_eq!(dispatcher.metrics().snapshot().subscriptions_suspended, 1);

    // Suspended subscriptions are skipped.
    append(&h, &crossing_event(80, 8_000, 10_000, 6)).await;
    eventually("crossing handled", || {
        dispatcher.metrics().snapshot().crossings == 6 && stream.backlog() == 0
    })
    .await;
    assert_eq!(dispatcher.metrics().snapshot().webhooks_failed, 5);

    subscriptions.reactivate(&ada(), &sub.id).await.unwrap();
    h.transport.failing.lock().clear();
    append(&h, &crossing_event(80, 8_000, 10_000, 7)).await;
    eventually("recovered delivery", || {
        dispatcher.metrics().snapshot().crossings == 7 && stream.backlog() == 0
    })
    .await;
    assert_eq!(h.transport.delivered.lock().len(), 1);
    let current = subscriptions.get(&ada(), &sub.id).await.unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::Active);
    assert_eq!(current.consecutive_failures, 0);

    h.pipeline.shutdown().await.unwrap();
}
