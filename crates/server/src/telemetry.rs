//! Tracing subscriber setup.
//!
//! Always installs an `EnvFilter` plus `fmt` layer. With
//! `[telemetry] enabled = true` an OpenTelemetry layer exporting over OTLP is
//! added, so authorizer, aggregator and dispatcher spans reach a collector
//! tagged with the quota policy they ran under.

use std::time::Duration;

use opentelemetry::trace::TracerProvider;
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{BatchSpanProcessor, Sampler, SdkTracerProvider};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{MeterConfig, OtlpProtocol, TelemetryConfig};

const EXPORT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opaque handle returned by [`init`]. Dropping it is a no-op; call
/// [`TelemetryGuard::shutdown`] for a clean flush of pending spans.
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl TelemetryGuard {
    /// Flush pending spans and shut down the exporter.
    pub fn shutdown(mut self) {
        if let Some(provider) = self.provider.take()
            && let Err(e) = provider.shutdown()
        {
            tracing::warn!(error = %e, "OpenTelemetry tracer provider shutdown failed");
        }
    }
}

/// Install the global subscriber. Must be called once, before the pipeline
/// is built.
///
/// An exporter that fails to build leaves fmt-only tracing installed and
/// logs the error.
pub fn init(config: &MeterConfig) -> TelemetryGuard {
    let telemetry = &config.telemetry;
    let fmt_layer = tracing_subscriber::fmt::layer();

    if !telemetry.enabled {
        tracing_subscriber::registry()
            .with(env_filter(telemetry))
            .with(fmt_layer)
            .init();
        return TelemetryGuard { provider: None };
    }

    let exporter = match build_exporter(telemetry) {
        Ok(exporter) => exporter,
        Err(e) => {
            tracing_subscriber::registry()
                .with(env_filter(telemetry))
                .with(fmt_layer)
                .init();
            tracing::error!(
                error = %e,
                endpoint = %telemetry.endpoint,
                "failed to build OTLP exporter, falling back to fmt-only tracing"
            );
            return TelemetryGuard { provider: None };
        }
    };

    let provider = SdkTracerProvider::builder()
        .with_span_processor(BatchSpanProcessor::builder(exporter).build())
        .with_sampler(sampler(telemetry))
        .with_resource(
            Resource::builder()
                .with_attributes(resource_attributes(config))
                .build(),
        )
        .build();
    global::set_tracer_provider(provider.clone());

    let otel_layer = tracing_opentelemetry::layer().with_tracer(provider.tracer("meter"));
    tracing_subscriber::registry()
        .with(env_filter(telemetry))
        .with(fmt_layer)
        .with(otel_layer)
        .init();

    info!(
        endpoint = %telemetry.endpoint,
        protocol = ?telemetry.protocol,
        sample_ratio = telemetry.sample_ratio,
        "OpenTelemetry tracing enabled"
    );

    TelemetryGuard {
        provider: Some(provider),
    }
}

/// `RUST_LOG` wins over `log_filter`; an unparsable directive falls back to
/// `info`.
fn env_filter(config: &TelemetryConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn sampler(config: &TelemetryConfig) -> Sampler {
    if config.sample_ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if config.sample_ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(config.sample_ratio)
    }
}

/// Service identity plus the quota policy, then operator attributes, which
/// may override either.
fn resource_attributes(config: &MeterConfig) -> Vec<KeyValue> {
    let authorizer = &config.authorizer;
    let thresholds = authorizer
        .thresholds
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");

    let mut attributes = vec![
        KeyValue::new("service.name", env!("CARGO_PKG_NAME")),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        KeyValue::new(
            "meter.quota.limit",
            i64::try_from(authorizer.quota_limit).unwrap_or(i64::MAX),
        ),
        KeyValue::new("meter.quota.window", authorizer.window.label()),
        KeyValue::new("meter.quota.thresholds", thresholds),
        KeyValue::new("meter.state.backend", config.state.backend.clone()),
    ];
    let mut extra: Vec<_> = config.telemetry.resource_attributes.iter().collect();
    extra.sort();
    for (key, value) in extra {
        attributes.push(KeyValue::new(key.clone(), value.clone()));
    }
    attributes
}

fn build_exporter(
    config: &TelemetryConfig,
) -> Result<opentelemetry_otlp::SpanExporter, opentelemetry::trace::TraceError> {
    let builder = opentelemetry_otlp::SpanExporter::builder();
    match config.protocol {
        OtlpProtocol::Grpc => builder
            .with_tonic()
            .with_endpoint(&config.endpoint)
            .with_timeout(EXPORT_TIMEOUT)
            .build(),
        OtlpProtocol::Http => builder
            .with_http()
            .with_endpoint(&config.endpoint)
            .with_timeout(EXPORT_TIMEOUT)
            .build(),
    }
}
