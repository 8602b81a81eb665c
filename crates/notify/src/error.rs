use std::time::Duration;

use meter_email::EmailError;
use meter_state::StateError;
use meter_webhook::WebhookError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Webhook(#[from] WebhookError),

    #[error(transparent)]
    Email(#[from] EmailError),

    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("corrupt record at {key}: {source}")]
    CorruptRecord {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("gave up updating {key} after {attempts} attempts")]
    Contention { key: String, attempts: u32 },

    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
}

impl DispatchError {
    /// Short reason recorded on a subscription after a failed delivery.
    pub fn failure_reason(&self) -> String {
        match self {
            Self::Webhook(WebhookError::UnexpectedStatus { status, .. }) => format!("HTTP {status}"),
            Self::Webhook(e) => e.kind().to_owned(),
            Self::Timeout(_) => "timeout".to_owned(),
            other => other.to_string(),
        }
    }
}
