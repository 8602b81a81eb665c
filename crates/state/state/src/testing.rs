//! Conformance suite and fault injection helpers for [`StateStore`] backends.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::StateError;
use crate::key::{KeyKind, StateKey};
use crate::store::{CasResult, StateStore, WriteOp};

fn test_key(kind: KeyKind, id: &str) -> StateKey {
    StateKey::new("test-scope", kind, id)
}

/// Run the full state store conformance test suite.
///
/// Call this from your backend's test module with a fresh store instance.
///
/// # Errors
///
/// Returns an error if any conformance test fails.
pub async fn run_store_conformance_tests(store: &dyn StateStore) -> Result<(), StateError> {
    test_get_missing(store).await?;
    test_set_and_get(store).await?;
    test_check_and_set_new(store).await?;
    test_check_and_set_existing(store).await?;
    test_delete(store).await?;
    test_increment(store).await?;
    test_compare_and_swap(store).await?;
    test_versions(store).await?;
    test_scan_keys(store).await?;
    test_write_batch(store).await?;
    test_ttl_set(store).await?;
    Ok(())
}

async fn test_get_missing(store: &dyn StateStore) -> Result<(), StateError> {
    let key = test_key(KeyKind::Credential, "missing");
    assert!(store.get(&key).await?.is_none(), "get on missing key should return None");
    assert!(store.get_versioned(&key).await?.is_none());
    Ok(())
}

async fn test_set_and_get(store: &dyn StateStore) -> Result<(), StateError> {
    let key = test_key(KeyKind::Credential, "set-get");
    store.set(&key, "hello", None).await?;
    let val = store.get(&key).await?;
    assert_eq!(val.as_deref(), Some("hello"));
    Ok(())
}

async fn test_check_and_set_new(store: &dyn StateStore) -> Result<(), StateError> {
    let key = test_key(KeyKind::Dedup, "cas-new");
    let created = store.check_and_set(&key, "v1", None).await?;
    assert!(created, "check_and_set on new key should return true");
    let val = store.get(&key).await?;
    assert_eq!(val.as_deref(), Some("v1"));
    Ok(())
}

async fn test_check_and_set_existing(store: &dyn StateStore) -> Result<(), StateError> {
    let key = test_key(KeyKind::Dedup, "cas-existing");
    store.set(&key, "v1", None).await?;
    let created = store.check_and_set(&key, "v2", None).await?;
    assert!(!created, "check_and_set on existing key should return false");
    let val = store.get(&key).await?;
    assert_eq!(val.as_deref(), Some("v1"), "original value should remain");
    Ok(())
}

async fn test_delete(store: &dyn StateStore) -> Result<(), StateError> {
    let key = test_key(KeyKind::Credential, "to-delete");
    store.set(&key, "bye", None).await?;
    assert!(store.delete(&key).await?, "delete should return true for existing key");
    assert!(store.get(&key).await?.is_none(), "get after delete should return None");
    assert!(!store.delete(&key).await?, "delete on missing key should return false");
    Ok(())
}

async fn test_increment(store: &dyn StateStore) -> Result<(), StateError> {
    let key = test_key(KeyKind::Rollup, "counter-1");
    let val = store.increment(&key, 1, None).await?;
    assert_eq!(val, 1, "first increment from zero should yield 1");

    let val = store.increment(&key, 5, None).await?;
    assert_eq!(val, 6, "second increment should accumulate");

    let val = store.increment(&key, -2, None).await?;
    assert_eq!(val, 4, "negative delta should decrement");
    Ok(())
}

async fn test_compare_and_swap(store: &dyn StateStore) -> Result<(), StateError> {
    let key = test_key(KeyKind::Credential, "cas-version");
    store.set(&key, "initial", None).await?;

    let result = store.compare_and_swap(&key, 999, "updated", None).await?;
    assert!(
        matches!(result, CasResult::Conflict { current_version: 1, .. }),
        "CAS with wrong version should conflict"
    );

    let result = store.compare_and_swap(&key, 1, "updated", None).await?;
    assert_eq!(result, CasResult::Ok, "CAS with correct version should succeed");

    let result = store.compare_and_swap(&key, 1, "stale", None).await?;
    assert!(
        matches!(result, CasResult::Conflict { ref current_value, current_version: 2 }
            if current_value.as_deref() == Some("updated")),
        "second CAS at the old version should conflict"
    );

    let missing = test_key(KeyKind::Credential, "cas-missing");
    let result = store.compare_and_swap(&missing, 1, "x", None).await?;
    assert_eq!(
        result,
        CasResult::Conflict {
            current_value: None,
            current_version: 0
        }
    );
    Ok(())
}

async fn test_versions(store: &dyn StateStore) -> Result<(), StateError> {
    let key = test_key(KeyKind::QuotaWindow, "versions");
    store.set(&key, "a", None).await?;
    let (value, v1) = store.get_versioned(&key).await?.unwrap_or_default();
    assert_eq!(value, "a");
    store.set(&key, "b", None).await?;
    let (value, v2) = store.get_versioned(&key).await?.unwrap_or_default();
    assert_eq!(value, "b");
    assert!(v2 > v1, "every write must bump the version");
    Ok(())
}

async fn test_scan_keys(store: &dyn StateStore) -> Result<(), StateError> {
    store
        .set(&StateKey::new("scan-a", KeyKind::RateLimited, "100:x"), "1", None)
        .await?;
    store
        .set(&StateKey::new("scan-a", KeyKind::RateLimited, "200:y"), "2", None)
        .await?;
    store
        .set(&StateKey::new("scan-a", KeyKind::Dedup, "100:z"), "3", None)
        .await?;
    store
        .set(&StateKey::new("scan-b", KeyKind::RateLimited, "100:w"), "4", None)
        .await?;

    let mut all = store.scan_keys("scan-a", KeyKind::RateLimited, None).await?;
    all.sort_by(|a, b| a.0.id.cmp(&b.0.id));
    assert_eq!(all.len(), 2, "scan must stay within scope and kind");
    assert_eq!(all[0].0.id, "100:x");
    assert_eq!(all[1].1, "2");

    let filtered = store
        .scan_keys("scan-a", KeyKind::RateLimited, Some("2"))
        .await?;
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].0.id, "200:y");
    Ok(())
}

async fn test_write_batch(store: &dyn StateStore) -> Result<(), StateError> {
    let counter = test_key(KeyKind::Rollup, "batch-counter");
    let marker = test_key(KeyKind::Rollup, "batch-marker");
    let put = test_key(KeyKind::Rollup, "batch-put");
    store
        .write_batch(&[
            WriteOp::Increment {
                key: counter.clone(),
                delta: 3,
                ttl: None,
            },
            WriteOp::Increment {
                key: counter.clone(),
                delta: 4,
                ttl: None,
            },
            WriteOp::PutIfAbsent {
                key: marker.clone(),
                value: "first".into(),
                ttl: None,
            },
            WriteOp::PutIfAbsent {
                key: marker.clone(),
                value: "second".into(),
                ttl: None,
            },
            WriteOp::Put {
                key: put.clone(),
                value: "v".into(),
                ttl: None,
            },
        ])
        .await?;
    assert_eq!(store.get(&counter).await?.as_deref(), Some("7"));
    assert_eq!(store.get(&marker).await?.as_deref(), Some("first"));
    assert_eq!(store.get(&put).await?.as_deref(), Some("v"));

    let oversized: Vec<WriteOp> = (0..=store.max_batch_items())
        .map(|i| WriteOp::Increment {
            key: test_key(KeyKind::Rollup, &format!("oversized-{i}")),
            delta: 1,
            ttl: None,
        })
        .collect();
    let result = store.write_batch(&oversized).await;
    assert!(
        matches!(result, Err(StateError::BatchTooLarge { .. })),
        "oversized batch must be rejected"
    );
    Ok(())
}

async fn test_ttl_set(store: &dyn StateStore) -> Result<(), StateError> {
    let key = test_key(KeyKind::Dedup, "ttl-test");
    store
        .set(&key, "ephemeral", Some(Duration::from_secs(3600)))
        .await?;
    let val = store.get(&key).await?;
    assert_eq!(val.as_deref(), Some("ephemeral"));
    Ok(())
}

/// A [`StateStore`] decorator that fails on demand.
///
/// Failures can be switched on for every operation or only for keys of a
/// given [`KeyKind`]. Used to exercise degraded-store behavior.
pub struct FaultyStateStore {
    inner: Arc<dyn StateStore>,
    fail_all: AtomicBool,
    fail_kinds: Mutex<HashSet<String>>,
    injected: AtomicU64,
}

impl FaultyStateStore {
    pub fn new(inner: Arc<dyn StateStore>) -> Self {
        Self {
            inner,
            fail_all: AtomicBool::new(false),
            fail_kinds: Mutex::new(HashSet::new()),
            injected: AtomicU64::new(0),
        }
    }

    /// Fail every operation while `on` is set.
    pub fn fail_all(&self, on: bool) {
        self.fail_all.store(on, Ordering::SeqCst);
    }

    /// Fail operations on keys of `kind`.
    pub fn fail_kind(&self, kind: &KeyKind) {
        self.fail_kinds.lock().insert(kind.as_str().to_owned());
    }

    /// Stop failing anything.
    pub fn heal(&self) {
        self.fail_all(false);
        self.fail_kinds.lock().clear();
    }

    /// Number of failures injected so far.
    pub fn injected(&self) -> u64 {
        self.injected.load(Ordering::SeqCst)
    }

    fn check(&self, kind: &KeyKind) -> Result<(), StateError> {
        if self.fail_all.load(Ordering::SeqCst) || self.fail_kinds.lock().contains(kind.as_str())
        {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(StateError::Connection("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for FaultyStateStore {
    async fn check_and_set(
        &self,
        key: &StateKey,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StateError> {
        self.check(&key.kind)?;
        self.inner.check_and_set(key, value, ttl).await
    }

    async fn get(&self, key: &StateKey) -> Result<Option<String>, StateError> {
        self.check(&key.kind)?;
        self.inner.get(key).await
    }

    async fn get_versioned(&self, key: &StateKey) -> Result<Option<(String, u64)>, StateError> {
        self.check(&key.kind)?;
        self.inner.get_versioned(key).await
    }

    async fn set(
        &self,
        key: &StateKey,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StateError> {
        self.check(&key.kind)?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &StateKey) -> Result<bool, StateError> {
        self.check(&key.kind)?;
        self.inner.delete(key).await
    }

    async fn increment(
        &self,
        key: &StateKey,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, StateError> {
        self.check(&key.kind)?;
        self.inner.increment(key, delta, ttl).await
    }

    async fn compare_and_swap(
        &self,
        key: &StateKey,
        expected_version: u64,
        new_value: &str,
        ttl: Option<Duration>,
    ) -> Result<CasResult, StateError> {
        self.check(&key.kind)?;
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
        self.check(&kind)?;
        self.inner.scan_keys(scope, kind, prefix).await
    }

    fn max_batch_items(&self) -> usize {
        self.inner.max_batch_items()
    }

    async fn write_batch(&self, ops: &[WriteOp]) -> Result<(), StateError> {
        for op in ops {
            self.check(&op.key().kind)?;
        }
        self.inner.write_batch(ops).await
    }
}
