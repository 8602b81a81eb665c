use thiserror::Error;

use meter_state::StateError;
use meter_stream::StreamError;

/// Errors raised while aggregating. Per-record and per-chunk errors are
/// counted and skipped; only these reach callers of the query API or the
/// worker loop.
#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("event stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("query range too wide: {buckets} buckets (max {max})")]
    RangeTooWide { buckets: i64, max: i64 },
}
