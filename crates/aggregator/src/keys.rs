//! Storage key layout for aggregated data.
//!
//! Rollup counters: `{granularity}:{bucket}:{field}` plus credential set
//! markers `{granularity}:{bucket}:cred:{credential}` under the rollup scope.
//! Dashboard ring: `{minute}:{field}`. Security tallies (global scope):
//! `{minute}:reason:{code}`, `{minute}:source:{ip}`, `{minute}:total`.
//! Rate-limit records: `{timestamp_ms}:{event_id}` under the principal.

use chrono::{DateTime, Utc};

use meter_core::{CredentialId, Granularity};
use meter_state::{KeyKind, StateKey};

pub const FIELD_CALLS: &str = "calls";
pub const FIELD_SUCCESSES: &str = "successes";
pub const FIELD_FAILURES: &str = "failures";
pub const FIELD_LATENCY: &str = "latency_ms_total";
pub const FIELD_RATE_LIMITED: &str = "rate_limited";
pub const FIELD_THRESHOLDS: &str = "thresholds_crossed";
pub const CREDENTIAL_MARKER: &str = "cred";

pub fn rollup_field(scope: &str, granularity: Granularity, bucket: i64, field: &str) -> StateKey {
    StateKey::new(
        scope,
        KeyKind::Rollup,
        format!("{}:{bucket}:{field}", granularity.label()),
    )
}

pub fn rollup_credential(
    scope: &str,
    granularity: Granularity,
    bucket: i64,
    credential: &CredentialId,
) -> StateKey {
    StateKey::new(
        scope,
        KeyKind::Rollup,
        format!("{}:{bucket}:{CREDENTIAL_MARKER}:{credential}", granularity.label()),
    )
}

pub fn dashboard_field(scope: &str, minute: i64, field: &str) -> StateKey {
    StateKey::new(scope, KeyKind::Dashboard, format!("{minute}:{field}"))
}

pub fn security_reason(minute: i64, code: &str) -> StateKey {
    StateKey::global(KeyKind::Security, format!("{minute}:reason:{code}"))
}

pub fn security_source(minute: i64, source: &str) -> StateKey {
    StateKey::global(KeyKind::Security, format!("{minute}:source:{source}"))
}

pub fn security_total(minute: i64) -> StateKey {
    StateKey::global(KeyKind::Security, format!("{minute}:total"))
}

/// Zero-padded so lexical order matches time order.
pub fn rate_limited(scope: &str, at: DateTime<Utc>, event_id: &str) -> StateKey {
    StateKey::new(
        scope,
        KeyKind::RateLimited,
        format!("{:013}:{event_id}", at.timestamp_millis().max(0)),
    )
}

pub fn processed(event_id: &str) -> StateKey {
    StateKey::global(KeyKind::Dedup, event_id)
}

/// Split a rollup id `{granularity}:{bucket}:{rest}` into bucket and rest.
pub fn parse_rollup_id(id: &str) -> Option<(i64, &str)> {
    let mut parts = id.splitn(3, ':');
    let _granularity = parts.next()?;
    let bucket = parts.next()?.parse().ok()?;
    Some((bucket, parts.next()?))
}
