use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{Span, debug, error, info, instrument, warn};

use meter_core::{
    AuthContext, Credential, Decision, DenyReason, PrincipalId, QuotaDecision, RequestMeta,
    SecretDigest, UsageEvent, UsageEventKind, decide,
};

use crate::cache::QuotaCache;
use crate::config::AuthorizerConfig;
use crate::error::AuthorizerError;
use crate::metrics::AuthorizerMetrics;
use crate::repository::CredentialRepository;
use crate::side_effects::SideEffectQueue;

/// One inbound request to authorize.
#[derive(Clone, Default)]
pub struct AuthRequest {
    /// Raw presented secret. Hashed immediately and never stored or logged.
    pub secret: String,
    pub method: String,
    pub path: String,
    pub source_ip: Option<String>,
}

impl std::fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthRequest")
            .field("secret", &"[redacted]")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("source_ip", &self.source_ip)
            .finish()
    }
}

impl AuthRequest {
    pub fn new(
        secret: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            secret: secret.into(),
            method: method.into(),
            path: path.into(),
            source_ip: None,
        }
    }

    #[must_use]
    pub fn with_source_ip(mut self, ip: impl Into<String>) -> Self {
        self.source_ip = Some(ip.into());
        self
    }
}

/// What the evaluation decided, plus what is needed to describe it in events.
struct Evaluation {
    decision: Decision,
    credential: Option<Credential>,
    extra: Option<UsageEventKind>,
}

impl Evaluation {
    fn deny(reason: DenyReason, credential: Option<Credential>) -> Self {
        Self {
            decision: Decision::Deny(reason),
            credential,
            extra: None,
        }
    }
}

/// Tracks concurrent authorizations per principal.
#[derive(Debug, Default)]
struct InFlight {
    counts: DashMap<PrincipalId, u64>,
}

impl InFlight {
    fn enter(&self, principal: &PrincipalId) -> (InFlightGuard<'_>, u64) {
        let current = {
            let mut count = self.counts.entry(principal.clone()).or_insert(0);
            *count += 1;
            *count
        };
        (
            InFlightGuard {
                owner: self,
                principal: principal.clone(),
            },
            current,
        )
    }
}

struct InFlightGuard<'a> {
    owner: &'a InFlight,
    principal: PrincipalId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.owner
            .counts
            .remove_if_mut(&self.principal, |_, count| {
                *count = count.saturating_sub(1);
                *count == 0
            });
    }
}

/// Per-request decision engine enforcing a principal's shared quota.
pub struct Authorizer {
    repository: CredentialRepository,
    cache: QuotaCache,
    side_effects: SideEffectQueue,
    config: AuthorizerConfig,
    metrics: Arc<AuthorizerMetrics>,
    in_flight: InFlight,
}

impl Authorizer {
    pub fn new(
        repository: CredentialRepository,
        cache: QuotaCache,
        side_effects: SideEffectQueue,
        config: AuthorizerConfig,
        metrics: Arc<AuthorizerMetrics>,
    ) -> Self {
        Self {
            repository,
            cache,
            side_effects,
            config,
            metrics,
            in_flight: InFlight::default(),
        }
    }

    pub fn cache(&self) -> &QuotaCache {
        &self.cache
    }

    pub fn repository(&self) -> &CredentialRepository {
        &self.repository
    }

    pub fn metrics(&self) -> &Arc<AuthorizerMetrics> {
        &self.metrics
    }

    /// Decide whether `request` may proceed.
    ///
    /// Never fails: any internal error resolves to a deny with
    /// [`DenyReason::InternalError`]. A usage event is queued for every
    /// decision; queueing never blocks the caller.
    #[instrument(
        skip_all,
        fields(
            method = %request.method,
            path = %request.path,
            principal = tracing::field::Empty,
            outcome = tracing::field::Empty,
        )
    )]
    pub async fn authorize(&self, request: &AuthRequest) -> Decision {
        let started = Instant::now();
        let digest = SecretDigest::of(&request.secret);

        let evaluation = match self.evaluate(&digest).await {
            Ok(evaluation) => evaluation,
            Err(e) => {
                error!(digest = %digest, error = %e, "authorization failed closed");
                Evaluation::deny(DenyReason::InternalError, None)
            }
        };

        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let meta = RequestMeta {
            path: request.path.clone(),
            method: request.method.clone(),
            source_ip: request.source_ip.clone(),
            latency_ms,
        };
        let span = Span::current();
        if let Some(credential) = &evaluation.credential {
            span.record("principal", credential.principal.as_str());
        }
        span.record("outcome", outcome_label(&evaluation.decision));

        self.record(&evaluation, &meta);
        evaluation.decision
    }

    async fn evaluate(&self, digest: &SecretDigest) -> Result<Evaluation, AuthorizerError> {
        let credential = match self.cache.get(digest).await {
            Some(credential) => {
                self.metrics.increment_cache_hit();
                credential
            }
            None => {
                self.metrics.increment_cache_miss();
                let Some(credential) = self.repository.find_by_digest(digest).await? else {
                    debug!(digest = %digest, "unknown credential");
                    return Ok(Evaluation::deny(DenyReason::InvalidCredential, None));
                };
                self.cache.insert(digest.clone(), credential.clone()).await;
                credential
            }
        };

        if !credential.is_active() {
            debug!(credential_id = %credential.id, status = %credential.status, "inactive credential");
            return Ok(Evaluation::deny(DenyReason::InvalidCredential, Some(credential)));
        }

        let principal = credential.principal.clone();
        let (_guard, in_flight) = self.in_flight.enter(&principal);
        self.metrics.observe_in_flight(in_flight);

        let now = Utc::now();
        let window = self
            .repository
            .current_window(&principal, &self.config.quota.window, now)
            .await?;
        let siblings = self.repository.list_by_principal(&principal).await?;

        let grant = match decide(
            &siblings,
            &credential.id,
            &window,
            self.config.quota.limit,
            &self.config.thresholds,
        ) {
            QuotaDecision::NotActive => {
                // The cached record is stale: deleted or deactivated since.
                self.cache.invalidate(digest).await;
                return Ok(Evaluation::deny(DenyReason::InvalidCredential, Some(credential)));
            }
            QuotaDecision::Exceeded { usage, limit } => {
                info!(principal = %principal, usage, limit, "quota exceeded");
                return Ok(Evaluation {
                    decision: Decision::Deny(DenyReason::QuotaExceeded),
                    credential: Some(credential),
                    extra: Some(UsageEventKind::RateLimited { usage, limit }),
                });
            }
            QuotaDecision::Allow(grant) => grant,
        };

        let Some(updated) = self
            .repository
            .record_call(&principal, &credential.id, &window, now)
            .await?
        else {
            warn!(credential_id = %credential.id, "credential vanished before increment");
            self.cache.invalidate(digest).await;
            return Ok(Evaluation::deny(DenyReason::InvalidCredential, Some(credential)));
        };

        let extra = grant.crossed_threshold.map(|threshold| {
            self.metrics.increment_threshold_crossed();
            info!(principal = %principal, threshold, usage = grant.usage_after, "usage threshold crossed");
            UsageEventKind::ThresholdCrossed {
                threshold,
                usage: grant.usage_after,
                limit: grant.limit,
                reset_at: grant.reset_at,
            }
        });

        let context = AuthContext {
            principal,
            credential_id: updated.id.clone(),
            credential_name: updated.name.clone(),
            usage_count: grant.usage_after,
            usage_limit: grant.limit,
            remaining_calls: grant.remaining,
            usage_reset_date: grant.reset_at,
        };
        Ok(Evaluation {
            decision: Decision::Allow(context),
            credential: Some(updated),
            extra,
        })
    }

    /// Update counters and queue the usage events for a decision.
    fn record(&self, evaluation: &Evaluation, meta: &RequestMeta) {
        let principal = evaluation.credential.as_ref().map(|c| c.principal.clone());
        let credential_id = evaluation.credential.as_ref().map(|c| c.id.clone());

        let primary = match &evaluation.decision {
            Decision::Allow(_) => {
                self.metrics.increment_allowed();
                UsageEventKind::ApiCall { success: true }
            }
            Decision::Deny(reason) => {
                self.metrics.increment_denied(*reason);
                match (reason, &evaluation.extra) {
                    (DenyReason::QuotaExceeded, Some(kind)) => kind.clone(),
                    _ => UsageEventKind::AuthFailed { reason: *reason },
                }
            }
        };
        self.side_effects.submit(UsageEvent::new(
            primary,
            principal.clone(),
            credential_id.clone(),
            meta.clone(),
        ));

        if let (Decision::Allow(_), Some(kind)) = (&evaluation.decision, &evaluation.extra) {
            self.side_effects.submit(UsageEvent::new(
                kind.clone(),
                principal,
                credential_id,
                meta.clone(),
            ));
        }
    }
}

/// Span label for a decision: `allowed` or the deny code.
fn outcome_label(decision: &Decision) -> &'static str {
    match decision {
        Decision::Allow(_) => "allowed",
        Decision::Deny(reason) => reason.code(),
    }
}
