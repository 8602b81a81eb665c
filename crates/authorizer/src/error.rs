use thiserror::Error;

use meter_state::StateError;
use meter_stream::StreamError;

/// Errors raised inside the authorizer.
///
/// None of these reach the caller of [`Authorizer::authorize`](crate::Authorizer::authorize);
/// they are logged and turned into a `Deny`.
#[derive(Debug, Error)]
pub enum AuthorizerError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("event stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("corrupt record at {key}: {source}")]
    CorruptRecord {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("gave up after {attempts} conflicting updates of {key}")]
    Contention { key: String, attempts: u32 },

    #[error("secret is already registered")]
    DuplicateSecret,

    #[error("credential not found: {0}")]
    NotFound(String),
}
