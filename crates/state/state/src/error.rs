use thiserror::Error;

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("CAS conflict: expected version {expected}, found {found}")]
    CasConflict { expected: u64, found: u64 },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("batch of {size} items exceeds backend limit of {max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl From<serde_json::Error> for StateError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
