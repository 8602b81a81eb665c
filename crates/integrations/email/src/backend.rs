use async_trait::async_trait;

use crate::error::EmailError;

/// An outgoing message with optional HTML and plain-text parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
}

impl EmailMessage {
    pub fn new(from: impl Into<String>, to: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            subject: subject.into(),
            text_body: None,
            html_body: None,
        }
    }

    #[must_use]
    pub fn with_text(mut self, body: impl Into<String>) -> Self {
        self.text_body = Some(body.into());
        self
    }

    #[must_use]
    pub fn with_html(mut self, body: impl Into<String>) -> Self {
        self.html_body = Some(body.into());
        self
    }
}

/// Result of a successful send.
#[derive(Debug, Clone)]
pub struct EmailResult {
    /// Transport-assigned message identifier, if any.
    pub message_id: Option<String>,
    /// `"sent"` or `"queued"`.
    pub status: String,
}

/// Pluggable mail transport.
#[async_trait]
pub trait EmailBackend: Send + Sync + std::fmt::Debug {
    async fn send(&self, message: &EmailMessage) -> Result<EmailResult, EmailError>;

    async fn health_check(&self) -> Result<(), EmailError>;

    /// Backend name, e.g. `"smtp"`.
    fn backend_name(&self) -> &'static str;
}
