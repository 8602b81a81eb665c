use std::time::Duration;

use meter_core::SUSPEND_AFTER_FAILURES;

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Overall bound on one webhook delivery, connect to last byte.
    pub webhook_timeout: Duration,
    /// Consecutive failures that suspend a subscription.
    pub suspend_after: u32,
    pub email_enabled: bool,
    /// Sender address for notification email.
    pub from_address: String,
    /// CAS retries when recording a delivery outcome.
    pub max_update_attempts: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            webhook_timeout: Duration::from_secs(5),
            suspend_after: SUSPEND_AFTER_FAILURES,
            email_enabled: true,
            from_address: "noreply@localhost".to_owned(),
            max_update_attempts: 8,
        }
    }
}
