use std::time::Duration;

use meter_core::{Granularity, THRESHOLD_LADDER};

/// How long rollups of each granularity are kept.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub minute: Duration,
    pub hour: Duration,
    pub day: Duration,
}

impl RetentionConfig {
    #[must_use]
    pub fn for_granularity(&self, granularity: Granularity) -> Duration {
        match granularity {
            Granularity::Minute => self.minute,
            Granularity::Hour => self.hour,
            Granularity::Day => self.day,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            minute: Duration::from_secs(2 * 86_400),
            hour: Duration::from_secs(30 * 86_400),
            day: Duration::from_secs(90 * 86_400),
        }
    }
}

/// Runtime settings for [`UsageAggregator`](crate::UsageAggregator) and its
/// worker.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Records pulled from the stream per batch.
    pub batch_size: usize,
    /// Writes per store batch request; capped by the store's own limit.
    pub chunk_size: usize,
    pub poll_interval: Duration,
    /// How long processed event ids are remembered.
    pub dedupe_ttl: Duration,
    pub retention: RetentionConfig,
    /// Length of the last-hour dashboard ring, in minutes.
    pub ring_minutes: u32,
    /// Ladder used to re-validate threshold events before notifying.
    pub thresholds: Vec<u8>,
    /// Sources reported in a security view.
    pub top_sources: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            chunk_size: 25,
            poll_interval: Duration::from_secs(1),
            dedupe_ttl: Duration::from_secs(24 * 3_600),
            retention: RetentionConfig::default(),
            ring_minutes: 60,
            thresholds: THRESHOLD_LADDER.to_vec(),
            top_sources: 10,
        }
    }
}

impl AggregatorConfig {
    /// Ring entries live one minute longer than the ring itself.
    #[must_use]
    pub fn ring_ttl(&self) -> Duration {
        Duration::from_secs((u64::from(self.ring_minutes) + 1) * 60)
    }
}
