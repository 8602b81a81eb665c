use std::sync::atomic::{AtomicU64, Ordering};

use meter_core::DenyReason;

/// Atomic counters tracking authorization outcomes.
///
/// All counters use relaxed ordering. For a consistent point-in-time view,
/// call [`snapshot`](Self::snapshot).
#[derive(Debug, Default)]
pub struct AuthorizerMetrics {
    pub allowed: AtomicU64,
    pub denied_invalid_credential: AtomicU64,
    pub denied_quota_exceeded: AtomicU64,
    pub denied_internal_error: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub thresholds_crossed: AtomicU64,
    /// Events accepted by the side-effect queue.
    pub events_enqueued: AtomicU64,
    /// Events dropped because the queue was full or closed.
    pub events_dropped: AtomicU64,
    /// Appends that failed or timed out.
    pub events_failed: AtomicU64,
    pub invalidations_applied: AtomicU64,
    /// Highest number of concurrent authorizations seen for one principal.
    pub peak_in_flight: AtomicU64,
}

impl AuthorizerMetrics {
    pub fn increment_allowed(&self) {
        self.allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_denied(&self, reason: DenyReason) {
        let counter = match reason {
            DenyReason::InvalidCredential => &self.denied_invalid_credential,
            DenyReason::QuotaExceeded => &self.denied_quota_exceeded,
            DenyReason::InternalError => &self.denied_internal_error,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_threshold_crossed(&self) {
        self.thresholds_crossed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_enqueued(&self) {
        self.events_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_failed(&self) {
        self.events_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_invalidation(&self) {
        self.invalidations_applied.fetch_add(1, Ordering::Relaxed);
    }

    /// Raise the in-flight high-water mark to `current` if it is higher.
    pub fn observe_in_flight(&self, current: u64) {
        self.peak_in_flight.fetch_max(current, Ordering::Relaxed);
    }

    /// Take a point-in-time snapshot of all counters.
    pub fn snapshot(&self) -> AuthorizerMetricsSnapshot {
        AuthorizerMetricsSnapshot {
            allowed: self.allowed.load(Ordering::Relaxed),
            denied_invalid_credential: self.denied_invalid_credential.load(Ordering::Relaxed),
            denied_quota_exceeded: self.denied_quota_exceeded.load(Ordering::Relaxed),
            denied_internal_error: self.denied_internal_error.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            thresholds_crossed: self.thresholds_crossed.load(Ordering::Relaxed),
            events_enqueued: self.events_enqueued.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
            invalidations_applied: self.invalidations_applied.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`AuthorizerMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct AuthorizerMetricsSnapshot {
    pub allowed: u64,
    pub denied_invalid_credential: u64,
    pub denied_quota_exceeded: u64,
    pub denied_internal_error: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub thresholds_crossed: u64,
    pub events_enqueued: u64,
    pub events_dropped: u64,
    pub events_failed: u64,
    pub invalidations_applied: u64,
    pub peak_in_flight: u64,
}

impl AuthorizerMetricsSnapshot {
    #[must_use]
    pub fn denied(&self) -> u64 {
        self.denied_invalid_credential + self.denied_quota_exceeded + self.denied_internal_error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denials_are_split_by_reason() {
        let m = AuthorizerMetrics::default();
        m.increment_denied(DenyReason::QuotaExceeded);
        m.increment_denied(DenyReason::QuotaExceeded);
        m.increment_denied(DenyReason::InternalError);
        let snap = m.snapshot();
        assert_eq!(snap.denied_quota_exceeded, 2);
        assert_eq!(snap.denied_internal_error, 1);
        assert_eq!(snap.denied(), 3);
    }

    #[test]
    fn peak_in_flight_only_grows() {
        let m = AuthorizerMetrics::default();
        m.observe_in_flight(3);
        m.observe_in_flight(1);
        assert_eq!(m.snapshot().peak_in_flight, 3);
    }
}
