use std::time::Duration;

use meter_stream::MemoryStreamConfig;
use serde::Deserialize;

/// Event stream and invalidation channel settings.
#[derive(Debug, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_partitions")]
    pub partitions: usize,
    /// Seconds a polled, unacknowledged record stays hidden before it is
    /// redelivered.
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_seconds: u64,
    #[serde(default = "default_retention")]
    pub retention_per_partition: usize,
    #[serde(default = "default_max_payload")]
    pub max_payload_bytes: usize,
    /// Topic name of the cache invalidation channel.
    #[serde(default = "default_invalidation_topic")]
    pub invalidation_topic: String,
    #[serde(default = "default_invalidation_capacity")]
    pub invalidation_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            partitions: default_partitions(),
            visibility_timeout_seconds: default_visibility_timeout(),
            retention_per_partition: default_retention(),
            max_payload_bytes: default_max_payload(),
            invalidation_topic: default_invalidation_topic(),
            invalidation_capacity: default_invalidation_capacity(),
        }
    }
}

impl StreamConfig {
    pub fn to_memory_config(&self) -> MemoryStreamConfig {
        MemoryStreamConfig {
            partitions: self.partitions.max(1),
            visibility_timeout: Duration::from_secs(self.visibility_timeout_seconds),
            retention_per_partition: self.retention_per_partition,
            max_payload_bytes: self.max_payload_bytes,
        }
    }
}

fn default_partitions() -> usize {
    4
}

fn default_visibility_timeout() -> u64 {
    30
}

fn default_retention() -> usize {
    100_000
}

fn default_max_payload() -> usize {
    64 * 1024
}

fn default_invalidation_topic() -> String {
    "credential-invalidation".to_owned()
}

fn default_invalidation_capacity() -> usize {
    1024
}
