use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::WebhookError;

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_user_agent() -> String {
    "meter-webhook/0.1".to_owned()
}

/// Settings shared by every delivery made through one transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookClientConfig {
    /// Overall per-request timeout.
    #[serde(default = "default_timeout", with = "duration_secs")]
    pub timeout: Duration,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Permit plain `http://` endpoints. Only meant for local testing.
    #[serde(default)]
    pub allow_insecure: bool,
}

impl Default for WebhookClientConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            user_agent: default_user_agent(),
            allow_insecure: false,
        }
    }
}

impl WebhookClientConfig {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_insecure_endpoints(mut self) -> Self {
        self.allow_insecure = true;
        self
    }
}

/// Parse `url` and require HTTPS unless `allow_insecure` is set.
pub fn validate_endpoint(url: &str, allow_insecure: bool) -> Result<reqwest::Url, WebhookError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| WebhookError::InvalidUrl(format!("{url}: {e}")))?;
    match parsed.scheme() {
        "https" => {}
        "http" if allow_insecure => {}
        _ => return Err(WebhookError::InsecureUrl(url.to_owned())),
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(WebhookError::InvalidUrl(format!("{url}: missing host")));
    }
    Ok(parsed)
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
