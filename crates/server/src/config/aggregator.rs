use std::time::Duration;

use meter_aggregator::{AggregatorConfig, RetentionConfig};
use serde::Deserialize;

const DAY_SECS: u64 = 86_400;

/// Usage aggregation settings.
#[derive(Debug, Deserialize)]
pub struct AggregatorSection {
    /// Whether the consumer loop runs in this process.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_dedupe_ttl")]
    pub dedupe_ttl_hours: u64,
    #[serde(default = "default_minute_retention")]
    pub minute_retention_days: u64,
    #[serde(default = "default_hour_retention")]
    pub hour_retention_days: u64,
    #[serde(default = "default_day_retention")]
    pub day_retention_days: u64,
    #[serde(default = "default_ring_minutes")]
    pub ring_minutes: u32,
    #[serde(default = "default_top_sources")]
    pub top_sources: usize,
}

impl Default for AggregatorSection {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            batch_size: default_batch_size(),
            chunk_size: default_chunk_size(),
            poll_interval_ms: default_poll_interval(),
            dedupe_ttl_hours: default_dedupe_ttl(),
            minute_retention_days: default_minute_retention(),
            hour_retention_days: default_hour_retention(),
            day_retention_days: default_day_retention(),
            ring_minutes: default_ring_minutes(),
            top_sources: default_top_sources(),
        }
    }
}

impl AggregatorSection {
    /// Runtime config. Threshold events are validated against `thresholds`,
    /// the same ladder the authorizer uses.
    pub fn to_aggregator_config(&self, thresholds: &[u8]) -> AggregatorConfig {
        AggregatorConfig {
            batch_size: self.batch_size.max(1),
            chunk_size: self.chunk_size.max(1),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            dedupe_ttl: Duration::from_secs(self.dedupe_ttl_hours * 3_600),
            retention: RetentionConfig {
                minute: Duration::from_secs(self.minute_retention_days * DAY_SECS),
                hour: Duration::from_secs(self.hour_retention_days * DAY_SECS),
                day: Duration::from_secs(self.day_retention_days * DAY_SECS),
            },
            ring_minutes: self.ring_minutes.max(1),
            thresholds: thresholds.to_vec(),
            top_sources: self.top_sources,
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_batch_size() -> usize {
    100
}

fn default_chunk_size() -> usize {
    25
}

fn default_poll_interval() -> u64 {
    1_000
}

fn default_dedupe_ttl() -> u64 {
    24
}

fn default_minute_retention() -> u64 {
    2
}

fn default_hour_retention() -> u64 {
    30
}

fn default_day_retention() -> u64 {
    90
}

fn default_ring_minutes() -> u32 {
    60
}

fn default_top_sources() -> usize {
    10
}
