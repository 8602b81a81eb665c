use std::collections::BTreeSet;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{CredentialId, PrincipalId};

/// Size of an aggregation time bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Minute,
    Hour,
    Day,
}

impl Granularity {
    pub const ALL: [Self; 3] = [Self::Minute, Self::Hour, Self::Day];

    #[must_use]
    pub fn seconds(self) -> i64 {
        match self {
            Self::Minute => 60,
            Self::Hour => 3_600,
            Self::Day => 86_400,
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }

    /// Epoch-aligned bucket index containing `ts`.
    #[must_use]
    pub fn bucket_index(self, ts: DateTime<Utc>) -> i64 {
        ts.timestamp().div_euclid(self.seconds())
    }

    /// Start of the bucket with the given index.
    #[must_use]
    pub fn bucket_start(self, index: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(index * self.seconds(), 0)
            .single()
            .unwrap_or(DateTime::UNIX_EPOCH)
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Who a rollup is accumulated for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollupScope {
    Principal(PrincipalId),
    Global,
}

impl RollupScope {
    /// Scope string used as the storage partition.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Principal(p) => p.as_str(),
            Self::Global => "global",
        }
    }
}

/// Additive counters for one (scope, bucket).
///
/// Merging is commutative and associative, so replays and out-of-order
/// batches produce the same totals as in-order delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupDelta {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub latency_ms_total: u64,
    pub credentials: BTreeSet<CredentialId>,
}

impl RollupDelta {
    /// Account one call.
    pub fn record(&mut self, success: bool, latency_ms: u64, credential: Option<&CredentialId>) {
        self.calls += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.latency_ms_total += latency_ms;
        if let Some(id) = credential {
            self.credentials.insert(id.clone());
        }
    }

    /// Fold `other` into `self`.
    pub fn merge(&mut self, other: &Self) {
        self.calls += other.calls;
        self.successes += other.successes;
        self.failures += other.failures;
        self.latency_ms_total += other.latency_ms_total;
        self.credentials.extend(other.credentials.iter().cloned());
    }
}

/// A materialized rollup read back from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rollup {
    pub scope: RollupScope,
    pub granularity: Granularity,
    pub bucket_start: DateTime<Utc>,
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub latency_ms_total: u64,
    pub unique_credentials: u64,
}

impl Rollup {
    /// Mean latency per call, or `None` for an empty bucket.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn avg_latency_ms(&self) -> Option<f64> {
        (self.calls > 0).then(|| self.latency_ms_total as f64 / self.calls as f64)
    }
}
