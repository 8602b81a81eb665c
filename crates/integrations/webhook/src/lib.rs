//! Signed webhook delivery.
//!
//! Payloads are signed with HMAC-SHA256 over `{timestamp}.{payload}` using a
//! per-subscription secret and POSTed with `Signature` and `Timestamp`
//! headers. Receivers check the signature with [`verify`].
//!
//! ```rust,no_run
//! use meter_webhook::{HttpWebhookTransport, WebhookClientConfig, WebhookDelivery, WebhookTransport};
//!
//! # async fn demo() -> Result<(), meter_webhook::WebhookError> {
//! let transport = HttpWebhookTransport::new(WebhookClientConfig::default())?;
//! let body = serde_json::json!({"type": "usage.threshold"});
//! let delivery = WebhookDelivery::new("https://hooks.example.com/usage", "whsec_abc", &body, 1_760_000_000)?;
//! let response = transport.deliver(&delivery).await?;
//! assert!((200..300).contains(&response.status_code));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod signing;
pub mod transport;
pub mod types;

pub use config::{WebhookClientConfig, validate_endpoint};
pub use error::WebhookError;
pub use signing::{SIGNATURE_HEADER, TIMESTAMP_HEADER, sign, verify};
pub use transport::{HttpWebhookTransport, WebhookTransport};
pub use types::{WebhookDelivery, WebhookResponse};
