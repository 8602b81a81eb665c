use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmailError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("failed to build email: {0}")]
    Build(String),

    /// The server may accept the message on a later attempt.
    #[error("transient SMTP error: {0}")]
    Transient(String),

    #[error("permanent SMTP error: {0}")]
    Permanent(String),

    #[error("email configuration error: {0}")]
    Configuration(String),
}

impl EmailError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
