mod aggregator;
mod authorizer;
mod dispatcher;
mod state;
mod stream;
mod telemetry;


pub use aggregator::*;
pub use authorizer::*;
pub use dispatcher::*;
pub use state::*;
pub use stream::*;
pub use telemetry::*;

use std::path::Path;

use meter_email::EmailConfig;
use serde::Deserialize;

use crate::error::ServerError;

/// Top-level configuration, loaded from `meter.toml`. Every field has a
/// default, so an empty file is valid.
#[derive(Debug, Deserialize)]
pub struct MeterConfig {
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub authorizer: AuthorizerSection,
    #[serde(default)]
    pub aggregator: AggregatorSection,
    #[serde(default)]
    pub dispatcher: DispatcherSection,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// Seconds each background task gets to stop on shutdown.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            state: StateConfig::default(),
            stream: StreamConfig::default(),
            cache: CacheConfig::default(),
            authorizer: AuthorizerSection::default(),
            aggregator: AggregatorSection::default(),
            dispatcher: DispatcherSection::default(),
            email: EmailConfig::default(),
            telemetry: TelemetryConfig::default(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
        }
    }
}

fn default_shutdown_timeout() -> u64 {
    10
}

impl MeterConfig {
    pub fn from_toml(contents: &str) -> Result<Self, ServerError> {
        toml::from_str(contents).map_err(|e| ServerError::Config(e.to_string()))
    }

    /// Load `path`, or defaults when it does not exist. The flag reports
    /// whether the file was found.
    pub fn load(path: &Path) -> Result<(Self, bool), ServerError> {
        if !path.exists() {
            return Ok((Self::default(), false));
        }
        let contents = std::fs::read_to_string(path)?;
        Ok((Self::from_toml(&contents)?, true))
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.state.backend != "memory" {
            return Err(ServerError::Config(format!(
                "unsupported state backend: {}",
                self.state.backend
            )));
        }
        if self.authorizer.quota_limit == 0 {
            return Err(ServerError::Config("authorizer.quota_limit must be positive".into()));
        }
        if self.authorizer.window.duration_seconds() == 0 {
            return Err(ServerError::Config("authorizer.window must be positive".into()));
        }
        if let Some(bad) = self
            .authorizer
            .thresholds
            .iter()
            .find(|t| **t == 0 || **t > 100)
        {
            return Err(ServerError::Config(format!(
                "threshold {bad} must be between 1 and 100"
            )));
        }
        if !(0.0..=1.0).contains(&self.telemetry.sample_ratio) {
            return Err(ServerError::Config(
                "telemetry.sample_ratio must be between 0.0 and 1.0".into(),
            ));
        }
        Ok(())
    }
}
