use std::time::Duration;

use meter_core::SUSPEND_AFTER_FAILURES;
use meter_notify::DispatcherConfig;
use serde::Deserialize;

/// Threshold notification settings.
#[derive(Debug, Deserialize)]
pub struct DispatcherSection {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_webhook_timeout")]
    pub webhook_timeout_seconds: u64,
    #[serde(default = "default_suspend_after")]
    pub suspend_after: u32,
    /// Send threshold email to principals at their preferred thresholds
    /// ({50, 75, 90} without a preference). Delivery goes through the
    /// `[email]` section, which defaults to SMTP on `localhost:587`.
    #[serde(default = "default_enabled")]
    pub email_enabled: bool,
    /// Accept `http://` webhook endpoints. Local testing only.
    #[serde(default)]
    pub allow_insecure_endpoints: bool,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            webhook_timeout_seconds: default_webhook_timeout(),
            suspend_after: default_suspend_after(),
            email_enabled: default_enabled(),
            allow_insecure_endpoints: false,
        }
    }
}

impl DispatcherSection {
    pub fn to_dispatcher_config(&self, from_address: &str) -> DispatcherConfig {
        DispatcherConfig {
            webhook_timeout: Duration::from_secs(self.webhook_timeout_seconds.max(1)),
            suspend_after: self.suspend_after.max(1),
            email_enabled: self.email_enabled,
            from_address: from_address.to_owned(),
            ..DispatcherConfig::default()
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_webhook_timeout() -> u64 {
    5
}

fn default_suspend_after() -> u32 {
    SUSPEND_AFTER_FAILURES
}
