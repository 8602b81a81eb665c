use std::time::Duration;

use async_trait::async_trait;

use crate::error::StateError;
use crate::key::{KeyKind, StateKey};

/// Default upper bound on the number of items in one [`StateStore::write_batch`].
pub const DEFAULT_MAX_BATCH_ITEMS: usize = 25;

/// Result of a compare-and-swap operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// The swap succeeded and the new version is stored.
    Ok,
    /// The swap failed because the current version didn't match.
    Conflict {
        current_value: Option<String>,
        current_version: u64,
    },
}

/// One write inside a [`StateStore::write_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Add `delta` to a counter, creating it at zero.
    Increment {
        key: StateKey,
        delta: i64,
        ttl: Option<Duration>,
    },
    /// Overwrite a value.
    Put {
        key: StateKey,
        value: String,
        ttl: Option<Duration>,
    },
    /// Write a value only if the key is absent.
    PutIfAbsent {
        key: StateKey,
        value: String,
        ttl: Option<Duration>,
    },
}

impl WriteOp {
    #[must_use]
    pub fn key(&self) -> &StateKey {
        match self {
            Self::Increment { key, .. } | Self::Put { key, .. } | Self::PutIfAbsent { key, .. } => {
                key
            }
        }
    }
}

/// Trait for persisting metering state.
///
/// Implementations must be `Send + Sync` and safe for concurrent access.
/// Every entry carries a version that starts at 1 and grows by one on each
/// write; [`compare_and_swap`](StateStore::compare_and_swap) is the only
/// conditional update primitive callers rely on.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Check if a key exists; if not, set it atomically with an optional TTL.
    /// Returns `true` if the key was newly set, `false` if it already existed.
    async fn check_and_set(
        &self,
        key: &StateKey,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StateError>;

    /// Get the value for a key. Returns `None` if not found or expired.
    async fn get(&self, key: &StateKey) -> Result<Option<String>, StateError>;

    /// Get the value together with its current version.
    async fn get_versioned(&self, key: &StateKey) -> Result<Option<(String, u64)>, StateError>;

    /// Set a value with an optional TTL, overwriting any previous value.
    async fn set(
        &self,
        key: &StateKey,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StateError>;

    /// Delete a key. Returns `true` if the key existed.
    async fn delete(&self, key: &StateKey) -> Result<bool, StateError>;

    /// Atomically increment a counter by `delta`. Returns the new value.
    /// Creates the counter at 0 if it doesn't exist before incrementing.
    async fn increment(
        &self,
        key: &StateKey,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, StateError>;

    /// Compare-and-swap: update value only if the current version matches.
    /// A missing key is reported as a conflict at version 0.
    async fn compare_and_swap(
        &self,
        key: &StateKey,
        expected_version: u64,
        new_value: &str,
        ttl: Option<Duration>,
    ) -> Result<CasResult, StateError>;

    /// Scan live keys of `kind` within `scope` whose id starts with `prefix`.
    ///
    /// This operation may be expensive on some backends. Use sparingly.
    async fn scan_keys(
        &self,
        scope: &str,
        kind: KeyKind,
        prefix: Option<&str>,
    ) -> Result<Vec<(StateKey, String)>, StateError>;

    /// Largest batch [`write_batch`](StateStore::write_batch) accepts.
    fn max_batch_items(&self) -> usize {
        DEFAULT_MAX_BATCH_ITEMS
    }

    /// Apply a batch of writes.
    ///
    /// Batches are not transactional: on error some writes may already have
    /// been applied. The default implementation applies them one by one.
    async fn write_batch(&self, ops: &[WriteOp]) -> Result<(), StateError> {
        let max = self.max_batch_items();
        if ops.len() > max {
            return Err(StateError::BatchTooLarge {
                size: ops.len(),
                max,
            });
        }
        for op in ops {
            match op {
                WriteOp::Increment { key, delta, ttl } => {
                    self.increment(key, *delta, *ttl).await?;
                }
                WriteOp::Put { key, value, ttl } => self.set(key, value, *ttl).await?,
                WriteOp::PutIfAbsent { key, value, ttl } => {
                    self.check_and_set(key, value, *ttl).await?;
                }
            }
        }
        Ok(())
    }
}
