use thiserror::Error;

/// Errors raised while preparing or delivering a webhook.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// Transport failure: connect, TLS, timeout or body read.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The endpoint answered with a non-2xx status.
    #[error("unexpected status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    /// The endpoint URL could not be parsed.
    #[error("invalid endpoint URL: {0}")]
    InvalidUrl(String),

    /// The endpoint does not use HTTPS.
    #[error("endpoint must use https: {0}")]
    InsecureUrl(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("HMAC signing error: {0}")]
    SigningError(String),

    /// The HTTP client could not be built.
    #[error("client configuration error: {0}")]
    Client(String),
}

impl WebhookError {
    /// Short label for logs and failure records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Http(e) if e.is_timeout() => "timeout",
            Self::Http(_) => "connection",
            Self::UnexpectedStatus { .. } => "status",
            Self::InvalidUrl(_) | Self::InsecureUrl(_) => "endpoint",
            Self::InvalidPayload(_) => "payload",
            Self::SigningError(_) => "signing",
            Self::Client(_) => "client",
        }
    }
}
