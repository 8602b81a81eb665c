use std::sync::Arc;
use std::sync::atomic::Ordering;

use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use meter_core::{MetricDatum, MetricsSink, ThresholdCrossing, ThresholdNotifier, UsageEvent};
use meter_state::{StateStore, WriteOp};
use meter_stream::StreamRecord;

use crate::config::AggregatorConfig;
use crate::keys;
use crate::metrics::AggregatorMetrics;
use crate::plan::{Classified, plan_writes, validate_crossing};

/// Summary of one processed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub received: usize,
    pub processed: usize,
    pub duplicates: usize,
    pub malformed: usize,
    pub api_calls: usize,
    pub auth_failures: usize,
    pub rate_limited: usize,
    pub thresholds: usize,
    pub writes: usize,
    pub failed_chunks: usize,
    pub notifications: usize,
}

/// Rolls batches of usage events into rollups, dashboards and security
/// tallies.
pub struct UsageAggregator {
    store: Arc<dyn StateStore>,
    config: AggregatorConfig,
    notifier: Option<Arc<dyn ThresholdNotifier>>,
    sink: Arc<dyn MetricsSink>,
    metrics: Arc<AggregatorMetrics>,
}

impl UsageAggregator {
    pub fn new(
        store: Arc<dyn StateStore>,
        config: AggregatorConfig,
        sink: Arc<dyn MetricsSink>,
        metrics: Arc<AggregatorMetrics>,
    ) -> Self {
        Self {
            store,
            config,
            notifier: None,
            sink,
            metrics,
        }
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn ThresholdNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<AggregatorMetrics> {
        &self.metrics
    }

    /// Aggregate one batch of raw stream records.
    ///
    /// Never fails as a whole: malformed records, failed dedupe lookups and
    /// failed write chunks are logged, counted and skipped.
    #[instrument(skip_all, fields(records = records.len()))]
    pub async fn process_batch(&self, records: &[StreamRecord]) -> BatchReport {
        let started = Instant::now();
        let mut report = BatchReport {
            received: records.len(),
            ..BatchReport::default()
        };

        let mut events = Vec::with_capacity(records.len());
        for record in records {
            match UsageEvent::decode(&record.payload) {
                Ok(event) => events.push(event),
                Err(e) => {
                    report.malformed += 1;
                    warn!(
                        partition = record.receipt.partition,
                        offset = record.receipt.offset,
                        error = %e,
                        "skipping malformed usage event"
                    );
                }
            }
        }

        let fresh = self.deduplicate(events, &mut report).await;
        report.processed = fresh.len();

        let classified = Classified::classify(fresh);
        report.api_calls = classified.api_calls.len();
        report.auth_failures = classified.auth_failures.len();
        report.rate_limited = classified.rate_limited.len();
        report.thresholds = classified.thresholds.len();

        let crossings: Vec<ThresholdCrossing> = classified
            .thresholds
            .iter()
            .filter_map(|event| {
                let crossing = validate_crossing(event, &self.config.thresholds);
                if crossing.is_none() {
                    AggregatorMetrics::add(&self.metrics.thresholds_rejected, 1);
                    warn!(event_id = %event.id, "dropping threshold event that does not match the ladder");
                }
                crossing
            })
            .collect();

        let ops = plan_writes(&classified, &crossings, &self.config);
        report.writes = ops.len();
        report.failed_chunks = self.write_chunked(&ops).await;

        report.notifications = self.notify(&crossings).await;

        let api_latency: u64 = classified
            .api_calls
            .iter()
            .map(|e| e.request.latency_ms)
            .sum();
        self.record_metrics(&report, api_latency, started).await;
        report
    }

    /// Drop events whose id was already processed. A failed lookup lets the
    /// event through.
    async fn deduplicate(&self, events: Vec<UsageEvent>, report: &mut BatchReport) -> Vec<UsageEvent> {
        let mut fresh = Vec::with_capacity(events.len());
        let mut seen = std::collections::HashSet::new();
        for event in events {
            if !seen.insert(event.id.clone()) {
                report.duplicates += 1;
                continue;
            }
            match self
                .store
                .check_and_set(&keys::processed(&event.id), "1", Some(self.config.dedupe_ttl))
                .await
            {
                Ok(true) => fresh.push(event),
                Ok(false) => {
                    report.duplicates += 1;
                    debug!(event_id = %event.id, "skipping redelivered event");
                }
                Err(e) => {
                    AggregatorMetrics::add(&self.metrics.dedupe_errors, 1);
                    warn!(event_id = %event.id, error = %e, "dedupe lookup failed, counting event anyway");
                    fresh.push(event);
                }
            }
        }
        fresh
    }

    /// Apply writes in store-sized chunks. Returns the number of chunks
    /// that failed.
    async fn write_chunked(&self, ops: &[WriteOp]) -> usize {
        let chunk_size = self
            .config
            .chunk_size
            .min(self.store.max_batch_items())
            .max(1);
        let mut failed = 0;
        for (index, chunk) in ops.chunks(chunk_size).enumerate() {
            if let Err(e) = self.store.write_batch(chunk).await {
                failed += 1;
                warn!(chunk = index, items = chunk.len(), error = %e, "skipping failed write chunk");
            }
        }
        failed
    }

    async fn notify(&self, crossings: &[ThresholdCrossing]) -> usize {
        let Some(notifier) = &self.notifier else {
            return 0;
        };
        join_all(crossings.iter().map(|c| notifier.notify(c))).await;
        crossings.len()
    }

    async fn record_metrics(&self, report: &BatchReport, api_latency: u64, started: Instant) {
        let m = &self.metrics;
        let as_u64 = |n: usize| u64::try_from(n).unwrap_or(u64::MAX);
        AggregatorMetrics::add(&m.batches, 1);
        AggregatorMetrics::add(&m.records, as_u64(report.received));
        AggregatorMetrics::add(&m.processed, as_u64(report.processed));
        AggregatorMetrics::add(&m.duplicates, as_u64(report.duplicates));
        AggregatorMetrics::add(&m.malformed, as_u64(report.malformed));
        AggregatorMetrics::add(&m.api_calls, as_u64(report.api_calls));
        AggregatorMetrics::add(&m.auth_failures, as_u64(report.auth_failures));
        AggregatorMetrics::add(&m.rate_limited, as_u64(report.rate_limited));
        AggregatorMetrics::add(&m.thresholds_crossed, as_u64(report.notifications));
        AggregatorMetrics::add(&m.writes, as_u64(report.writes));
        AggregatorMetrics::add(&m.failed_chunks, as_u64(report.failed_chunks));

        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let mut data = vec![
            MetricDatum::count("RecordsReceived", as_u64(report.received)),
            MetricDatum::count("RecordsProcessed", as_u64(report.processed)),
            MetricDatum::count("DuplicateRecords", as_u64(report.duplicates)),
            MetricDatum::count("MalformedRecords", as_u64(report.malformed)),
            MetricDatum::count("FailedChunks", as_u64(report.failed_chunks)),
            MetricDatum::millis("BatchProcessingTime", elapsed),
        ];
        for (label, n) in [
            ("api_call", report.api_calls),
            ("auth_failed", report.auth_failures),
            ("rate_limited", report.rate_limited),
            ("threshold_crossed", report.thresholds),
        ] {
            data.push(MetricDatum::count("EventsByType", as_u64(n)).with_dimension("type", label));
        }
        if report.api_calls > 0 {
            data.push(MetricDatum::millis(
                "AverageRequestLatency",
                api_latency / as_u64(report.api_calls),
            ));
        }
        self.sink.publish(data).await;

        if report.failed_chunks > 0 || report.malformed > 0 {
            warn!(
                failed_chunks = report.failed_chunks,
                malformed = report.malformed,
                "batch aggregated with errors"
            );
        } else {
            info!(
                processed = report.processed,
                duplicates = report.duplicates,
                writes = report.writes,
                "batch aggregated"
            );
        }
        debug!(total_batches = m.batches.load(Ordering::Relaxed), "aggregator progress");
    }
}
