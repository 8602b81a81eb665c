use thiserror::Error;

/// Errors from the event stream and the invalidation channel.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream closed")]
    Closed,

    #[error("payload of {size} bytes exceeds the {max} byte record limit")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("backend error: {0}")]
    Backend(String),
}
