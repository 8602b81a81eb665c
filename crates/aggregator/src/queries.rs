use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use meter_core::{CredentialId, Granularity, PrincipalId, Rollup, RollupScope};
use meter_state::{GLOBAL_SCOPE, KeyKind, StateStore};

use crate::config::AggregatorConfig;
use crate::error::AggregationError;
use crate::keys;

/// Widest bucket range a single rollup query may span.
pub const MAX_RANGE_BUCKETS: i64 = 10_000;

/// A rate-limited request kept for forensic lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRecord {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<CredentialId>,
    pub usage: u64,
    pub limit: u64,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
}

/// One minute of the last-hour dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DashboardSlot {
    pub minute_start: DateTime<Utc>,
    pub calls: u64,
    pub failures: u64,
    pub rate_limited: u64,
    pub latency_ms_total: u64,
}

/// Authentication failures seen in one minute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SecurityView {
    pub minute_start: DateTime<Utc>,
    pub total: u64,
    /// Failure count per deny reason code.
    pub reasons: BTreeMap<String, u64>,
    /// Busiest sources, highest count first.
    pub top_sources: Vec<(String, u64)>,
}

fn counter(raw: &str) -> u64 {
    raw.parse::<i64>()
        .ok()
        .and_then(|v| u64::try_from(v).ok())
        .unwrap_or(0)
}

/// Read side of the aggregated data.
#[derive(Clone)]
pub struct UsageQueries {
    store: Arc<dyn StateStore>,
    ring_minutes: u32,
    top_sources: usize,
}

impl UsageQueries {
    pub fn new(store: Arc<dyn StateStore>, config: &AggregatorConfig) -> Self {
        Self {
            store,
            ring_minutes: config.ring_minutes,
            top_sources: config.top_sources,
        }
    }

    /// Non-empty rollups for `scope` whose bucket overlaps `[from, to]`,
    /// oldest first.
    #[instrument(skip_all, fields(scope = scope.as_str(), granularity = %granularity))]
    pub async fn rollups(
        &self,
        scope: &RollupScope,
        granularity: Granularity,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Rollup>, AggregationError> {
        let first = granularity.bucket_index(from);
        let last = granularity.bucket_index(to);
        let buckets = last - first + 1;
        if buckets > MAX_RANGE_BUCKETS {
            return Err(AggregationError::RangeTooWide {
                buckets,
                max: MAX_RANGE_BUCKETS,
            });
        }

        let prefix = format!("{}:", granularity.label());
        let entries = self
            .store
            .scan_keys(scope.as_str(), KeyKind::Rollup, Some(&prefix))
            .await?;

        let mut by_bucket: BTreeMap<i64, Rollup> = BTreeMap::new();
        for (key, raw) in entries {
            let Some((bucket, field)) = keys::parse_rollup_id(&key.id) else {
                warn!(key = %key, "unparseable rollup key");
                continue;
            };
            if bucket < first || bucket > last {
                continue;
            }
            let rollup = by_bucket.entry(bucket).or_insert_with(|| Rollup {
                scope: scope.clone(),
                granularity,
                bucket_start: granularity.bucket_start(bucket),
                calls: 0,
                successes: 0,
                failures: 0,
                latency_ms_total: 0,
                unique_credentials: 0,
            });
            match field {
                keys::FIELD_CALLS => rollup.calls = counter(&raw),
                keys::FIELD_SUCCESSES => rollup.successes = counter(&raw),
                keys::FIELD_FAILURES => rollup.failures = counter(&raw),
                keys::FIELD_LATENCY => rollup.latency_ms_total = counter(&raw),
                other if other.starts_with(keys::CREDENTIAL_MARKER) => {
                    rollup.unique_credentials += 1;
                }
                _ => {}
            }
        }
        Ok(by_bucket.into_values().collect())
    }

    /// Per-bucket usage of one principal.
    pub async fn principal_summary(
        &self,
        principal: &PrincipalId,
        granularity: Granularity,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Rollup>, AggregationError> {
        self.rollups(
            &RollupScope::Principal(principal.clone()),
            granularity,
            from,
            to,
        )
        .await
    }

    /// The dashboard ring ending at `now`, one slot per minute, oldest first.
    /// Minutes without traffic are zero-filled.
    #[instrument(skip_all, fields(scope = scope.as_str()))]
    pub async fn last_hour(
        &self,
        scope: &RollupScope,
        now: DateTime<Utc>,
    ) -> Result<Vec<DashboardSlot>, AggregationError> {
        let current = Granularity::Minute.bucket_index(now);
        let oldest = current - i64::from(self.ring_minutes) + 1;
        let mut slots: BTreeMap<i64, DashboardSlot> = (oldest..=current)
            .map(|minute| {
                (
                    minute,
                    DashboardSlot {
                        minute_start: Granularity::Minute.bucket_start(minute),
                        ..DashboardSlot::default()
                    },
                )
            })
            .collect();

        let entries = self
            .store
            .scan_keys(scope.as_str(), KeyKind::Dashboard, None)
            .await?;
        for (key, raw) in entries {
            let Some((minute, field)) = key.id.split_once(':') else {
                continue;
            };
            let Some(slot) = minute.parse().ok().and_then(|m: i64| slots.get_mut(&m)) else {
                continue;
            };
            match field {
                keys::FIELD_CALLS => slot.calls = counter(&raw),
                keys::FIELD_FAILURES => slot.failures = counter(&raw),
                keys::FIELD_RATE_LIMITED => slot.rate_limited = counter(&raw),
                keys::FIELD_LATENCY => slot.latency_ms_total = counter(&raw),
                _ => {}
            }
        }
        Ok(slots.into_values().collect())
    }

    /// Failure reasons and top sources for the minute containing `at`.
    #[instrument(skip_all)]
    pub async fn security_view(&self, at: DateTime<Utc>) -> Result<SecurityView, AggregationError> {
        let minute = Granularity::Minute.bucket_index(at);
        let entries = self
            .store
            .scan_keys(GLOBAL_SCOPE, KeyKind::Security, Some(&format!("{minute}:")))
            .await?;

        let mut view = SecurityView {
            minute_start: Granularity::Minute.bucket_start(minute),
            ..SecurityView::default()
        };
        let mut sources: HashMap<String, u64> = HashMap::new();
        for (key, raw) in entries {
            let Some((_, rest)) = key.id.split_once(':') else {
                continue;
            };
            if rest == "total" {
                view.total = counter(&raw);
            } else if let Some(code) = rest.strip_prefix("reason:") {
                view.reasons.insert(code.to_owned(), counter(&raw));
            } else if let Some(source) = rest.strip_prefix("source:") {
                sources.insert(source.to_owned(), counter(&raw));
            }
        }
        let mut ranked: Vec<(String, u64)> = sources.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(self.top_sources);
        view.top_sources = ranked;
        Ok(view)
    }

    /// Most recent rate-limited requests of `principal`, newest first.
    #[instrument(skip_all, fields(principal = %principal))]
    pub async fn rate_limited_records(
        &self,
        principal: &PrincipalId,
        limit: usize,
    ) -> Result<Vec<RateLimitRecord>, AggregationError> {
        let mut entries = self
            .store
            .scan_keys(principal.as_str(), KeyKind::RateLimited, None)
            .await?;
        entries.sort_by(|a, b| b.0.id.cmp(&a.0.id));
        let mut records = Vec::with_capacity(limit.min(entries.len()));
        for (key, raw) in entries.into_iter().take(limit) {
            match serde_json::from_str(&raw) {
                Ok(record) => records.push(record),
                Err(e) => warn!(key = %key, error = %e, "unreadable rate-limit record"),
            }
        }
        Ok(records)
    }
}
