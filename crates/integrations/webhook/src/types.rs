use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::WebhookError;
use crate::signing::sign;

/// A signed request ready to be POSTed.
#[derive(Clone)]
pub struct WebhookDelivery {
    pub url: String,
    /// Serialized JSON body. Signed byte-for-byte.
    pub body: Vec<u8>,
    pub timestamp: i64,
    pub signature: String,
}

impl WebhookDelivery {
    /// Serialize `payload` and sign it with `secret` at `timestamp`.
    pub fn new(
        url: impl Into<String>,
        secret: &str,
        payload: &serde_json::Value,
        timestamp: i64,
    ) -> Result<Self, WebhookError> {
        let body =
            serde_json::to_vec(payload).map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;
        let signature = sign(secret, timestamp, &body)?;
        Ok(Self {
            url: url.into(),
            body,
            timestamp,
            signature,
        })
    }
}

impl fmt::Debug for WebhookDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookDelivery")
            .field("url", &self.url)
            .field("body_bytes", &self.body.len())
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}

/// Response received from a webhook endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub status_code: u16,
    /// Response body, truncated.
    pub body: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::verify;

    #[test]
    fn delivery_is_signed_over_exact_body() {
        let payload = serde_json::json!({"type": "usage.threshold", "data": {"threshold": 90}});
        let delivery = WebhookDelivery::new("https://h.example.com", "s", &payload, 99).unwrap();
        assert!(verify("s", 99, &delivery.body, &delivery.signature));
        let back: serde_json::Value = serde_json::from_slice(&delivery.body).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn debug_hides_signature() {
        let delivery =
            WebhookDelivery::new("https://h.example.com", "s", &serde_json::json!({}), 1).unwrap();
        let debug = format!("{delivery:?}");
        assert!(!debug.contains(&delivery.signature));
        assert!(debug.contains("h.example.com"));
    }
}
