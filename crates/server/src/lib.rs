pub mod config;
pub mod error;
pub mod pipeline;
pub mod state_factory;
pub mod telemetry;
