use thiserror::Error;

/// Errors that can occur when starting or running the metering server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// An I/O error (e.g. reading the config file).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state store error: {0}")]
    State(#[from] meter_state::StateError),

    #[error("notification setup failed: {0}")]
    Notify(#[from] meter_notify::DispatchError),

    #[error("webhook client setup failed: {0}")]
    Webhook(#[from] meter_webhook::WebhookError),

    #[error("email backend setup failed: {0}")]
    Email(#[from] meter_email::EmailError),

    /// A background task did not stop within the shutdown grace period.
    #[error("shutdown timed out waiting for {0}")]
    ShutdownTimeout(&'static str),
}
