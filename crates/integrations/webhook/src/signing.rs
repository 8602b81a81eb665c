use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::WebhookError;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "Signature";
pub const TIMESTAMP_HEADER: &str = "Timestamp";

const PREFIX: &str = "sha256=";

/// Sign `payload` for delivery at `timestamp` (unix seconds).
///
/// Returns `sha256=<hex>` of `HMAC-SHA256(secret, "{timestamp}.{payload}")`.
pub fn sign(secret: &str, timestamp: i64, payload: &[u8]) -> Result<String, WebhookError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| WebhookError::SigningError(format!("invalid HMAC key: {e}")))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(format!("{PREFIX}{}", hex::encode(mac.finalize().into_bytes())))
}

/// Check a received `signature` header in constant time.
pub fn verify(secret: &str, timestamp: i64, payload: &[u8], signature: &str) -> bool {
    let Ok(expected) = sign(secret, timestamp, payload) else {
        return false;
    };
    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_covers_timestamp_and_body() {
        let sig = sign("whsec_test", 1_760_000_000, br#"{"a":1}"#).unwrap();
        assert!(sig.starts_with("sha256="));
        assert_eq!(sig.len(), PREFIX.len() + 64);
        assert!(verify("whsec_test", 1_760_000_000, br#"{"a":1}"#, &sig));
        assert!(!verify("whsec_test", 1_760_000_001, br#"{"a":1}"#, &sig));
        assert!(!verify("whsec_test", 1_760_000_000, br#"{"a":2}"#, &sig));
        assert!(!verify("whsec_other", 1_760_000_000, br#"{"a":1}"#, &sig));
    }

    #[test]
    fn matches_manual_hmac() {
        let mut mac = HmacSha256::new_from_slice(b"k").unwrap();
        mac.update(b"42.body");
        let expected = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
        assert_eq!(sign("k", 42, b"body").unwrap(), expected);
    }

    #[test]
    fn truncated_signature_rejected() {
        let sig = sign("k", 1, b"x").unwrap();
        assert!(!verify("k", 1, b"x", &sig[..sig.len() - 1]));
    }
}
