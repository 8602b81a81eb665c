use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters tracking aggregation progress.
#[derive(Debug, Default)]
pub struct AggregatorMetrics {
    pub batches: AtomicU64,
    /// Records received from the stream, malformed and duplicates included.
    pub records: AtomicU64,
    pub processed: AtomicU64,
    pub duplicates: AtomicU64,
    pub malformed: AtomicU64,
    pub api_calls: AtomicU64,
    pub auth_failures: AtomicU64,
    pub rate_limited: AtomicU64,
    pub thresholds_crossed: AtomicU64,
    /// Threshold events that did not match the ladder and were dropped.
    pub thresholds_rejected: AtomicU64,
    pub writes: AtomicU64,
    pub failed_chunks: AtomicU64,
    /// Dedupe lookups that failed; the event was counted anyway.
    pub dedupe_errors: AtomicU64,
}

impl AggregatorMetrics {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AggregatorMetricsSnapshot {
        AggregatorMetricsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            records: self.records.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            api_calls: self.api_calls.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            thresholds_crossed: self.thresholds_crossed.load(Ordering::Relaxed),
            thresholds_rejected: self.thresholds_rejected.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            failed_chunks: self.failed_chunks.load(Ordering::Relaxed),
            dedupe_errors: self.dedupe_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`AggregatorMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct AggregatorMetricsSnapshot {
    pub batches: u64,
    pub records: u64,
    pub processed: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub api_calls: u64,
    pub auth_failures: u64,
    pub rate_limited: u64,
    pub thresholds_crossed: u64,
    pub thresholds_rejected: u64,
    pub writes: u64,
    pub failed_chunks: u64,
    pub dedupe_errors: u64,
}
