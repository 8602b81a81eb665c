use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Dispatcher counters.
#[derive(Debug, Default)]
pub struct DispatcherMetrics {
    pub crossings: AtomicU64,
    /// Crossings already notified for this window.
    pub duplicates_suppressed: AtomicU64,
    pub webhooks_delivered: AtomicU64,
    pub webhooks_failed: AtomicU64,
    pub subscriptions_suspended: AtomicU64,
    pub emails_sent: AtomicU64,
    pub emails_failed: AtomicU64,
    pub emails_skipped: AtomicU64,
    /// Lookups or writes against the store that failed.
    pub store_errors: AtomicU64,
}

impl DispatcherMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatcherMetricsSnapshot {
        DispatcherMetricsSnapshot {
            crossings: self.crossings.load(Ordering::Relaxed),
            duplicates_suppressed: self.duplicates_suppressed.load(Ordering::Relaxed),
            webhooks_delivered: self.webhooks_delivered.load(Ordering::Relaxed),
            webhooks_failed: self.webhooks_failed.load(Ordering::Relaxed),
            subscriptions_suspended: self.subscriptions_suspended.load(Ordering::Relaxed),
            emails_sent: self.emails_sent.load(Ordering::Relaxed),
            emails_failed: self.emails_failed.load(Ordering::Relaxed),
            emails_skipped: self.emails_skipped.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherMetricsSnapshot {
    pub crossings: u64,
    pub duplicates_suppressed: u64,
    pub webhooks_delivered: u64,
    pub webhooks_failed: u64,
    pub subscriptions_suspended: u64,
    pub emails_sent: u64,
    pub emails_failed: u64,
    pub emails_skipped: u64,
    pub store_errors: u64,
}
