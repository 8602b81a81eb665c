//! Request-time authorization against a principal's shared quota.
//!
//! [`Authorizer::authorize`] resolves a presented secret to a credential,
//! enforces the quota summed over every active credential of the owning
//! principal, increments the presented credential's counter and emits usage
//! events through a best-effort [`SideEffectQueue`].

pub mod authorizer;
pub mod cache;
pub mod config;
pub mod error;
pub mod listener;
pub mod metrics;
pub mod repository;
pub mod side_effects;

pub use authorizer::{AuthRequest, Authorizer};
pub use cache::QuotaCache;
pub use config::{AuthorizerConfig, SideEffectConfig};
pub use error::AuthorizerError;
pub use listener::InvalidationListener;
pub use metrics::{AuthorizerMetrics, AuthorizerMetricsSnapshot};
pub use repository::CredentialRepository;
pub use side_effects::SideEffectQueue;
