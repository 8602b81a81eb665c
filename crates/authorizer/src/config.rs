use std::time::Duration;

use meter_core::{QuotaPolicy, THRESHOLD_LADDER};

/// Runtime settings for [`Authorizer`](crate::Authorizer).
#[derive(Debug, Clone)]
pub struct AuthorizerConfig {
    pub quota: QuotaPolicy,
    /// Ascending percentage thresholds checked on every allowed call.
    pub thresholds: Vec<u8>,
    /// How long a cached credential may be served without a store read.
    pub cache_ttl: Duration,
    pub cache_capacity: u64,
    /// Bound on optimistic-concurrency retries for one record update.
    pub max_update_attempts: u32,
    pub side_effects: SideEffectConfig,
}

impl Default for AuthorizerConfig {
    fn default() -> Self {
        Self {
            quota: QuotaPolicy::default(),
            thresholds: THRESHOLD_LADDER.to_vec(),
            cache_ttl: Duration::from_secs(30),
            cache_capacity: 10_000,
            max_update_attempts: 8,
            side_effects: SideEffectConfig::default(),
        }
    }
}

/// Settings for the best-effort event emission queue.
#[derive(Debug, Clone)]
pub struct SideEffectConfig {
    /// Events buffered before new ones are dropped.
    pub queue_capacity: usize,
    /// Upper bound on one stream append.
    pub timeout: Duration,
    /// Appends running at once.
    pub max_concurrent: usize,
}

impl Default for SideEffectConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            timeout: Duration::from_secs(2),
            max_concurrent: 16,
        }
    }
}
