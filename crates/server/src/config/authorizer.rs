use std::time::Duration;

use meter_authorizer::{AuthorizerConfig, SideEffectConfig};
use meter_core::{QuotaPolicy, QuotaWindow, THRESHOLD_LADDER};
use serde::Deserialize;

/// Quota cache settings.
#[derive(Debug, Deserialize)]
pub struct CacheConfig {
    /// Seconds a cached credential is served without a store read.
    #[serde(default = "default_cache_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_cache_capacity")]
    pub capacity: u64,
    /// Seconds between cache maintenance passes. `0` disables the task.
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_cache_ttl(),
            capacity: default_cache_capacity(),
            maintenance_interval_seconds: default_maintenance_interval(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    30
}

fn default_cache_capacity() -> u64 {
    10_000
}

fn default_maintenance_interval() -> u64 {
    60
}

/// Quota and side-effect settings for the authorizer.
///
/// # Example
///
/// ```toml
/// [authorizer]
/// quota_limit = 10000
/// window = "monthly"
/// thresholds = [50, 80, 90, 95, 100]
/// ```
#[derive(Debug, Deserialize)]
pub struct AuthorizerSection {
    #[serde(default = "default_quota_limit")]
    pub quota_limit: u64,
    #[serde(default)]
    pub window: QuotaWindow,
    #[serde(default = "default_thresholds")]
    pub thresholds: Vec<u8>,
    #[serde(default = "default_max_update_attempts")]
    pub max_update_attempts: u32,
    #[serde(default = "default_queue_capacity")]
    pub side_effect_queue_capacity: usize,
    #[serde(default = "default_side_effect_timeout")]
    pub side_effect_timeout_ms: u64,
    #[serde(default = "default_side_effect_concurrency")]
    pub side_effect_max_concurrent: usize,
}

impl Default for AuthorizerSection {
    fn default() -> Self {
        Self {
            quota_limit: default_quota_limit(),
            window: QuotaWindow::default(),
            thresholds: default_thresholds(),
            max_update_attempts: default_max_update_attempts(),
            side_effect_queue_capacity: default_queue_capacity(),
            side_effect_timeout_ms: default_side_effect_timeout(),
            side_effect_max_concurrent: default_side_effect_concurrency(),
        }
    }
}

impl AuthorizerSection {
    /// Combine with the cache section into the runtime config. The ladder is
    /// sorted and de-duplicated.
    pub fn to_authorizer_config(&self, cache: &CacheConfig) -> AuthorizerConfig {
        let mut thresholds = self.thresholds.clone();
        thresholds.sort_unstable();
        thresholds.dedup();
        AuthorizerConfig {
            quota: QuotaPolicy {
                limit: self.quota_limit,
                window: self.window.clone(),
            },
            thresholds,
            cache_ttl: Duration::from_secs(cache.ttl_seconds),
            cache_capacity: cache.capacity,
            max_update_attempts: self.max_update_attempts.max(1),
            side_effects: SideEffectConfig {
                queue_capacity: self.side_effect_queue_capacity.max(1),
                timeout: Duration::from_millis(self.side_effect_timeout_ms),
                max_concurrent: self.side_effect_max_concurrent.max(1),
            },
        }
    }
}

fn default_quota_limit() -> u64 {
    10_000
}

fn default_thresholds() -> Vec<u8> {
    THRESHOLD_LADDER.to_vec()
}

fn default_max_update_attempts() -> u32 {
    8
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_side_effect_timeout() -> u64 {
    2_000
}

fn default_side_effect_concurrency() -> usize {
    16
}
