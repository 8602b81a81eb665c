use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};

use meter_core::ThresholdCrossing;

/// Canonical webhook body for a crossing.
///
/// ```json
/// {"id": "...", "type": "usage.threshold", "created_at": "...",
///  "data": {"principal": "...", "threshold": 90, "usage": 9000, "limit": 10000,
///           "remaining": 1000, "usage_percentage": 90.0, "reset_date": "..."}}
/// ```
pub fn webhook_payload(crossing: &ThresholdCrossing, event_id: &str, now: DateTime<Utc>) -> Value {
    let mut data = json!({
        "principal": crossing.principal,
        "threshold": crossing.threshold,
        "usage": crossing.usage,
        "limit": crossing.limit,
        "remaining": crossing.remaining(),
        "usage_percentage": usage_percentage(crossing.usage, crossing.limit),
        "reset_date": crossing.reset_at.to_rfc3339_opts(SecondsFormat::Secs, true),
    });
    if let Some(credential) = &crossing.credential_id {
        data["credential_id"] = json!(credential);
    }
    json!({
        "id": event_id,
        "type": crossing.event_type().as_str(),
        "created_at": now.to_rfc3339_opts(SecondsFormat::Millis, true),
        "data": data,
    })
}

/// Percentage rounded to two decimals.
#[allow(clippy::cast_precision_loss)]
pub fn usage_percentage(usage: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 100.0;
    }
    (usage as f64 * 10_000.0 / limit as f64).round() / 100.0
}

#[cfg(test)]
mod tests {
    use meter_core::{CredentialId, PrincipalId};

    use super::*;

    fn crossing(threshold: u8, usage: u64) -> ThresholdCrossing {
        ThresholdCrossing {
            principal: PrincipalId::from("ada@example.com"),
            credential_id: Some(CredentialId::from("cred_a")),
            threshold,
            usage,
            limit: 10_000,
            reset_at: DateTime::parse_from_rfc3339("2026-11-16T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    #[test]
    fn payload_shape() {
        let now = Utc::now();
        let body = webhook_payload(&crossing(90, 9_000), "evt_1", now);
        assert_eq!(body["id"], "evt_1");
        assert_eq!(body["type"], "usage.threshold");
        assert_eq!(body["data"]["remaining"], 1_000);
        assert_eq!(body["data"]["usage_percentage"], 90.0);
        assert_eq!(body["data"]["reset_date"], "2026-11-16T10:00:00Z");
        assert_eq!(body["data"]["credential_id"], "cred_a");
    }

    #[test]
    fn exhausted_type_at_100() {
        let body = webhook_payload(&crossing(100, 10_000), "evt_2", Utc::now());
        assert_eq!(body["type"], "usage.exhausted");
        assert_eq!(body["data"]["remaining"], 0);
    }

    #[test]
    fn percentage_rounding() {
        assert!((usage_percentage(1, 3) - 33.33).abs() < 1e-9);
        assert!((usage_percentage(5, 0) - 100.0).abs() < 1e-9);
    }
}
