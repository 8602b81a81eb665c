//! Pure translation of a de-duplicated batch into store writes.

use std::collections::{BTreeMap, HashMap};

use meter_core::{
    Granularity, PrincipalId, RollupDelta, RollupScope, ThresholdCrossing, UsageEvent,
    UsageEventKind, crossed,
};
use meter_state::{StateKey, WriteOp};
use tracing::warn;

use crate::config::AggregatorConfig;
use crate::keys;
use crate::queries::RateLimitRecord;

/// A batch split by event type.
#[derive(Debug, Default)]
pub struct Classified {
    pub api_calls: Vec<UsageEvent>,
    pub auth_failures: Vec<UsageEvent>,
    pub rate_limited: Vec<UsageEvent>,
    pub thresholds: Vec<UsageEvent>,
}

impl Classified {
    #[must_use]
    pub fn classify(events: Vec<UsageEvent>) -> Self {
        let mut out = Self::default();
        for event in events {
            match event.kind {
                UsageEventKind::ApiCall { .. } => out.api_calls.push(event),
                UsageEventKind::AuthFailed { .. } => out.auth_failures.push(event),
                UsageEventKind::RateLimited { .. } => out.rate_limited.push(event),
                UsageEventKind::ThresholdCrossed { .. } => out.thresholds.push(event),
            }
        }
        out
    }
}

/// Additive rollup deltas keyed by scope, granularity and bucket.
///
/// Each call lands in the principal's rollup (when known) and the global one,
/// at every granularity.
#[must_use]
pub fn rollup_deltas(
    api_calls: &[UsageEvent],
) -> BTreeMap<(RollupScope, Granularity, i64), RollupDelta> {
    let mut deltas: BTreeMap<(RollupScope, Granularity, i64), RollupDelta> = BTreeMap::new();
    for event in api_calls {
        let UsageEventKind::ApiCall { success } = event.kind else {
            continue;
        };
        let mut scopes = vec![RollupScope::Global];
        if let Some(principal) = &event.principal {
            scopes.push(RollupScope::Principal(principal.clone()));
        }
        for scope in scopes {
            for granularity in Granularity::ALL {
                let bucket = granularity.bucket_index(event.timestamp);
                deltas
                    .entry((scope.clone(), granularity, bucket))
                    .or_default()
                    .record(
                        success,
                        event.request.latency_ms,
                        event.credential_id.as_ref(),
                    );
            }
        }
    }
    deltas
}

/// Re-check a threshold event against the ladder. Returns the crossing only
/// if `threshold` is exactly what the detector reports for the last call.
#[must_use]
pub fn validate_crossing(event: &UsageEvent, ladder: &[u8]) -> Option<ThresholdCrossing> {
    let UsageEventKind::ThresholdCrossed {
        threshold,
        usage,
        limit,
        reset_at,
    } = event.kind
    else {
        return None;
    };
    let principal: PrincipalId = event.principal.clone()?;
    if crossed(usage.saturating_sub(1), usage, limit, ladder) != Some(threshold) {
        return None;
    }
    Some(ThresholdCrossing {
        principal,
        credential_id: event.credential_id.clone(),
        threshold,
        usage,
        limit,
        reset_at,
    })
}

/// Accumulates counter deltas per key before turning them into writes.
#[derive(Default)]
struct Tally {
    counters: HashMap<StateKey, (i64, Option<std::time::Duration>)>,
}

impl Tally {
    fn add(&mut self, key: StateKey, delta: u64, ttl: std::time::Duration) {
        if delta == 0 {
            return;
        }
        let entry = self.counters.entry(key).or_insert((0, Some(ttl)));
        entry.0 = entry.0.saturating_add(i64::try_from(delta).unwrap_or(i64::MAX));
    }

    fn into_ops(self) -> impl Iterator<Item = WriteOp> {
        self.counters
            .into_iter()
            .map(|(key, (delta, ttl))| WriteOp::Increment { key, delta, ttl })
    }
}

/// Every write the batch needs, in no particular order.
#[must_use]
pub fn plan_writes(
    classified: &Classified,
    crossings: &[ThresholdCrossing],
    config: &AggregatorConfig,
) -> Vec<WriteOp> {
    let mut tally = Tally::default();
    let mut ops = Vec::new();
    let ring_ttl = config.ring_ttl();

    for ((scope, granularity, bucket), delta) in rollup_deltas(&classified.api_calls) {
        let scope = scope.as_str();
        let ttl = config.retention.for_granularity(granularity);
        for (field, value) in [
            (keys::FIELD_CALLS, delta.calls),
            (keys::FIELD_SUCCESSES, delta.successes),
            (keys::FIELD_FAILURES, delta.failures),
            (keys::FIELD_LATENCY, delta.latency_ms_total),
        ] {
            tally.add(keys::rollup_field(scope, granularity, bucket, field), value, ttl);
        }
        for credential in &delta.credentials {
            ops.push(WriteOp::PutIfAbsent {
                key: keys::rollup_credential(scope, granularity, bucket, credential),
                value: "1".to_owned(),
                ttl: Some(ttl),
            });
        }
        if granularity == Granularity::Minute {
            for (field, value) in [
                (keys::FIELD_CALLS, delta.calls),
                (keys::FIELD_FAILURES, delta.failures),
                (keys::FIELD_LATENCY, delta.latency_ms_total),
            ] {
                tally.add(keys::dashboard_field(scope, bucket, field), value, ring_ttl);
            }
        }
    }

    let security_ttl = config.retention.minute;
    for event in &classified.auth_failures {
        let UsageEventKind::AuthFailed { reason } = event.kind else {
            continue;
        };
        let minute = Granularity::Minute.bucket_index(event.timestamp);
        tally.add(keys::security_total(minute), 1, security_ttl);
        tally.add(keys::security_reason(minute, reason.code()), 1, security_ttl);
        if let Some(ip) = &event.request.source_ip {
            tally.add(keys::security_source(minute, ip), 1, security_ttl);
        }
    }

    let record_ttl = config.retention.day;
    for event in &classified.rate_limited {
        let UsageEventKind::RateLimited { usage, limit } = event.kind else {
            continue;
        };
        let minute = Granularity::Minute.bucket_index(event.timestamp);
        tally.add(
            keys::dashboard_field(RollupScope::Global.as_str(), minute, keys::FIELD_RATE_LIMITED),
            1,
            ring_ttl,
        );
        let Some(principal) = &event.principal else {
            continue;
        };
        tally.add(
            keys::dashboard_field(principal.as_str(), minute, keys::FIELD_RATE_LIMITED),
            1,
            ring_ttl,
        );
        let record = RateLimitRecord {
            event_id: event.id.clone(),
            timestamp: event.timestamp,
            credential_id: event.credential_id.clone(),
            usage,
            limit,
            method: event.request.method.clone(),
            path: event.request.path.clone(),
            source_ip: event.request.source_ip.clone(),
        };
        match serde_json::to_string(&record) {
            Ok(value) => ops.push(WriteOp::PutIfAbsent {
                key: keys::rate_limited(principal.as_str(), event.timestamp, &event.id),
                value,
                ttl: Some(record_ttl),
            }),
            Err(e) => {
                warn!(
                    event_id = %event.id,
                    error = %e,
                    "skipping unserializable rate-limit record"
                );
            }
        }
    }

    for crossing in crossings {
        let day = Granularity::Day.bucket_index(crossing.reset_at);
        tally.add(
            keys::rollup_field(
                crossing.principal.as_str(),
                Granularity::Day,
                day,
                keys::FIELD_THRESHOLDS,
            ),
            1,
            config.retention.day,
        );
    }

    ops.extend(tally.into_ops());
    ops
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};
    use meter_core::{CredentialId, DenyReason, RequestMeta};
    use meter_state::KeyKind;

    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn call(principal: &str, cred: &str, ts: &str, success: bool, latency: u64) -> UsageEvent {
        let mut ev = UsageEvent::new(
            UsageEventKind::ApiCall { success },
            Some(PrincipalId::from(principal)),
            Some(CredentialId::from(cred)),
            RequestMeta {
                latency_ms: latency,
                ..RequestMeta::default()
            },
        );
        ev.timestamp = at(ts);
        ev
    }

    #[test]
    fn classify_splits_by_type() {
        let events = vec![
            call("a", "c1", "2026-10-17T10:00:00Z", true, 1),
            UsageEvent::new(
                UsageEventKind::AuthFailed {
                    reason: DenyReason::InvalidCredential,
                },
                None,
                None,
                RequestMeta::default(),
            ),
        ];
        let c = Classified::classify(events);
        assert_eq!(c.api_calls.len(), 1);
        assert_eq!(c.auth_failures.len(), 1);
        assert!(c.rate_limited.is_empty());
    }

    #[test]
    fn deltas_group_by_bucket_and_scope() {
        let events = vec![
            call("a", "c1", "2026-10-17T10:00:05Z", true, 10),
            call("a", "c2", "2026-10-17T10:00:50Z", false, 30),
            call("a", "c1", "2026-10-17T10:01:10Z", true, 20),
        ];
        let deltas = rollup_deltas(&events);
        let scope = RollupScope::Principal(PrincipalId::from("a"));
        let minute = Granularity::Minute.bucket_index(at("2026-10-17T10:00:00Z"));
        let first = &deltas[&(scope.clone(), Granularity::Minute, minute)];
        assert_eq!(first.calls, 2);
        assert_eq!(first.failures, 1);
        assert_eq!(first.latency_ms_total, 40);
        assert_eq!(first.credentials.len(), 2);

        let hour = Granularity::Hour.bucket_index(at("2026-10-17T10:00:00Z"));
        assert_eq!(deltas[&(scope, Granularity::Hour, hour)].calls, 3);
        assert_eq!(
            deltas[&(RollupScope::Global, Granularity::Day, Granularity::Day.bucket_index(at("2026-10-17T00:00:00Z")))].calls,
            3
        );
    }

    #[test]
    fn crossing_must_match_ladder() {
        let reset_at = at("2026-11-16T00:00:00Z");
        let mut ev = UsageEvent::new(
            UsageEventKind::ThresholdCrossed {
                threshold: 80,
                usage: 80,
                limit: 100,
                reset_at,
            },
            Some(PrincipalId::from("a")),
            None,
            RequestMeta::default(),
        );
        let crossing = validate_crossing(&ev, &meter_core::THRESHOLD_LADDER).unwrap();
        assert_eq!(crossing.threshold, 80);
        assert_eq!(crossing.remaining(), 20);

        ev.kind = UsageEventKind::ThresholdCrossed {
            threshold: 90,
            usage: 80,
            limit: 100,
            reset_at,
        };
        assert!(validate_crossing(&ev, &meter_core::THRESHOLD_LADDER).is_none());

        ev.principal = None;
        assert!(validate_crossing(&ev, &meter_core::THRESHOLD_LADDER).is_none());
    }

    #[test]
    fn rate_limited_event_plans_one_forensic_record() {
        let limited = |principal: Option<&str>| {
            UsageEvent::new(
                UsageEventKind::RateLimited {
                    usage: 100,
                    limit: 100,
                },
                principal.map(PrincipalId::from),
                Some(CredentialId::from("c1")),
                RequestMeta {
                    method: "GET".into(),
                    path: "/v1/deadlines".into(),
                    ..RequestMeta::default()
                },
            )
        };
        let classified = Classified::classify(vec![limited(Some("a")), limited(None)]);
        let ops = plan_writes(&classified, &[], &AggregatorConfig::default());

        let records: Vec<RateLimitRecord> = ops
            .iter()
            .filter_map(|op| match op {
                WriteOp::PutIfAbsent { key, value, .. } if key.kind == KeyKind::RateLimited => {
                    assert_eq!(key.scope, "a");
                    Some(serde_json::from_str(value).unwrap())
                }
                _ => None,
            })
            .collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].usage, 100);
        assert_eq!(records[0].path, "/v1/deadlines");
    }
}
