use std::collections::HashMap;

use serde::Deserialize;

/// OTLP transport for exported spans.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OtlpProtocol {
    #[default]
    Grpc,
    Http,
}

/// Log filtering and optional span export.
///
/// ```toml
/// [telemetry]
/// log_filter = "info,meter_authorizer=debug"
/// enabled = true
/// endpoint = "http://localhost:4317"
/// sample_ratio = 0.1
///
/// [telemetry.resource_attributes]
/// "deployment.environment" = "staging"
/// ```
///
/// Exported spans carry the quota policy as resource attributes, so traces
/// from differently configured deployments can be told apart.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// Export spans over OTLP.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub protocol: OtlpProtocol,
    /// Fraction of `authorize` traces kept, 0.0 to 1.0.
    #[serde(default = "default_sample_ratio")]
    pub sample_ratio: f64,
    #[serde(default)]
    pub resource_attributes: HashMap<String, String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            enabled: false,
            endpoint: default_endpoint(),
            protocol: OtlpProtocol::default(),
            sample_ratio: default_sample_ratio(),
            resource_attributes: HashMap::new(),
        }
    }
}

fn default_log_filter() -> String {
    "info".to_owned()
}

fn default_endpoint() -> String {
    "http://localhost:4317".to_owned()
}

fn default_sample_ratio() -> f64 {
    1.0
}
