use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

/// Unit attached to a published metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricUnit {
    Count,
    Milliseconds,
}

/// One numeric data point pushed to the monitoring collaborator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricDatum {
    pub name: String,
    pub value: f64,
    pub unit: MetricUnit,
    pub dimensions: BTreeMap<String, String>,
}

impl MetricDatum {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn count(name: impl Into<String>, value: u64) -> Self {
        Self {
            name: name.into(),
            value: value as f64,
            unit: MetricUnit::Count,
            dimensions: BTreeMap::new(),
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn millis(name: impl Into<String>, value: u64) -> Self {
        Self {
            name: name.into(),
            value: value as f64,
            unit: MetricUnit::Milliseconds,
            dimensions: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_dimension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(key.into(), value.into());
        self
    }
}

/// Fire-and-forget metrics sink. Publishing never fails the caller.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn publish(&self, data: Vec<MetricDatum>);
}

/// Sink that writes each datum as a structured `tracing` event.
#[derive(Debug, Default)]
pub struct TracingMetricsSink;

#[async_trait]
impl MetricsSink for TracingMetricsSink {
    async fn publish(&self, data: Vec<MetricDatum>) {
        for datum in data {
            info!(
                target: "meter::metrics",
                metric = %datum.name,
                value = datum.value,
                unit = ?datum.unit,
                dimensions = ?datum.dimensions,
                "metric"
            );
        }
    }
}

/// Sink that keeps everything in memory. Useful for tests and local runs.
#[derive(Debug, Default)]
pub struct MemoryMetricsSink {
    data: Mutex<Vec<MetricDatum>>,
}

impl MemoryMetricsSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far.
    pub fn published(&self) -> Vec<MetricDatum> {
        self.data.lock().clone()
    }

    /// Sum of values published under `name`.
    pub fn total(&self, name: &str) -> f64 {
        self.data
            .lock()
            .iter()
            .filter(|d| d.name == name)
            .map(|d| d.value)
            .sum()
    }
}

#[async_trait]
impl MetricsSink for MemoryMetricsSink {
    async fn publish(&self, data: Vec<MetricDatum>) {
        self.data.lock().extend(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_sink_accumulates() {
        let sink = MemoryMetricsSink::new();
        sink.publish(vec![
            MetricDatum::count("records", 3).with_dimension("type", "api_call"),
            MetricDatum::millis("latency", 12),
        ])
        .await;
        sink.publish(vec![MetricDatum::count("records", 2)]).await;

        assert_eq!(sink.published().len(), 3);
        assert!((sink.total("records") - 5.0).abs() < f64::EPSILON);
        assert_eq!(sink.published()[0].dimensions["type"], "api_call");
        assert_eq!(sink.published()[1].unit, MetricUnit::Milliseconds);
    }
}
