use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use crate::backend::{EmailBackend, EmailMessage, EmailResult};
use crate::error::EmailError;

/// Keeps sent messages in memory and logs them. Used for local runs and
/// tests.
#[derive(Debug, Default)]
pub struct MemoryEmailBackend {
    sent: Mutex<Vec<EmailMessage>>,
    failing: AtomicBool,
}

impl MemoryEmailBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent send fail with a transient error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl EmailBackend for MemoryEmailBackend {
    async fn send(&self, message: &EmailMessage) -> Result<EmailResult, EmailError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EmailError::Transient("memory backend set to fail".into()));
        }
        info!(to = %message.to, subject = %message.subject, "recorded email");
        self.sent.lock().push(message.clone());
        Ok(EmailResult {
            message_id: None,
            status: "sent".to_owned(),
        })
    }

    async fn health_check(&self) -> Result<(), EmailError> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
