//! Batch aggregation of usage events.
//!
//! The stream delivers events at least once and in no particular order, so
//! every write here is an additive increment or a create-if-absent marker.
//! Exact de-duplication is per event id and best-effort: dashboard counters
//! may over-count slightly under redelivery. Billing never reads from here.

pub mod aggregator;
pub mod config;
pub mod error;
pub mod keys;
pub mod metrics;
pub mod plan;
pub mod queries;
pub mod worker;

pub use aggregator::{BatchReport, UsageAggregator};
pub use config::{AggregatorConfig, RetentionConfig};
pub use error::AggregationError;
pub use metrics::{AggregatorMetrics, AggregatorMetricsSnapshot};
pub use queries::{DashboardSlot, RateLimitRecord, SecurityView, UsageQueries};
pub use worker::AggregatorWorker;
