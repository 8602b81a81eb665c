use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::credential::Credential;
use crate::threshold::crossed;
use crate::types::CredentialId;

/// Length of the rolling window over which a principal's quota applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaWindow {
    /// Rolling 24-hour window.
    Daily,
    /// Rolling 7-day window.
    Weekly,
    /// Rolling 30-day window.
    Monthly,
    /// Custom window duration in seconds.
    Custom {
        /// Window duration in seconds.
        seconds: u64,
    },
}

impl QuotaWindow {
    /// Return the window duration in seconds.
    #[must_use]
    pub fn duration_seconds(&self) -> u64 {
        match self {
            Self::Daily => 86_400,
            Self::Weekly => 604_800,
            Self::Monthly => 2_592_000,
            Self::Custom { seconds } => *seconds,
        }
    }

    /// Window duration as a `chrono::Duration`.
    #[must_use]
    pub fn duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.duration_seconds().cast_signed())
    }

    /// Return a short label for display.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::Daily => "daily".to_owned(),
            Self::Weekly => "weekly".to_owned(),
            Self::Monthly => "monthly".to_owned(),
            Self::Custom { seconds } => format!("custom_{seconds}s"),
        }
    }
}

impl Default for QuotaWindow {
    fn default() -> Self {
        Self::Monthly
    }
}

impl std::fmt::Display for QuotaWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

/// The shared quota every principal is held to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaPolicy {
    /// Maximum calls per window, summed over all active credentials.
    #[serde(default = "default_limit")]
    pub limit: u64,
    #[serde(default)]
    pub window: QuotaWindow,
}

fn default_limit() -> u64 {
    10_000
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            window: QuotaWindow::default(),
        }
    }
}

/// A principal's current quota window.
///
/// `seq` increases by one on every reset. Credential counters stamped with an
/// older `seq` are treated as zero, which makes the reset atomic across all
/// sibling credentials the moment the window record flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowState {
    pub seq: u64,
    pub reset_at: DateTime<Utc>,
}

impl WindowState {
    /// The first window for a principal that has never been metered.
    #[must_use]
    pub fn first(window: &QuotaWindow, now: DateTime<Utc>) -> Self {
        Self {
            seq: 1,
            reset_at: now + window.duration(),
        }
    }

    /// Whether `now` has passed the reset timestamp.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.reset_at
    }

    /// The window that replaces this one when it expires at `now`.
    #[must_use]
    pub fn next(&self, window: &QuotaWindow, now: DateTime<Utc>) -> Self {
        Self {
            seq: self.seq + 1,
            reset_at: now + window.duration(),
        }
    }
}

/// Outcome of [`decide`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaDecision {
    /// The call fits in the quota. The presented credential's counter should
    /// be incremented by exactly one.
    Allow(QuotaGrant),
    /// The principal's aggregate usage already meets the limit. Nothing is
    /// incremented.
    Exceeded { usage: u64, limit: u64 },
    /// The presented credential is no longer among the principal's active
    /// credentials.
    NotActive,
}

/// Counters resulting from an allowed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaGrant {
    pub usage_before: u64,
    pub usage_after: u64,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    /// Threshold crossed by this call, if any.
    pub crossed_threshold: Option<u8>,
}

/// Sum of usage in `window` across the active credentials in `siblings`.
#[must_use]
pub fn aggregate_usage(siblings: &[Credential], window: &WindowState) -> u64 {
    siblings
        .iter()
        .filter(|c| c.is_active())
        .map(|c| c.usage_in_window(window.seq))
        .sum()
}

/// Decide whether one more call by `presented` fits in the shared quota.
///
/// Pre-conditions: `siblings` is a fresh read of every credential owned by
/// the presented credential's principal, and `window` is the principal's
/// current, unexpired window.
///
/// Post-conditions: on `Allow`, `usage_before < limit`,
/// `usage_after == usage_before + 1` and `remaining == limit - usage_after`.
/// On `Exceeded`, `usage >= limit`. `NotActive` when `presented` is missing
/// from `siblings` or not active there.
#[must_use]
pub fn decide(
    siblings: &[Credential],
    presented: &CredentialId,
    window: &WindowState,
    limit: u64,
    thresholds: &[u8],
) -> QuotaDecision {
    if !siblings.iter().any(|c| &c.id == presented && c.is_active()) {
        return QuotaDecision::NotActive;
    }
    let usage = aggregate_usage(siblings, window);
    if usage >= limit {
        return QuotaDecision::Exceeded { usage, limit };
    }
    let usage_after = usage + 1;
    QuotaDecision::Allow(QuotaGrant {
        usage_before: usage,
        usage_after,
        limit,
        remaining: limit - usage_after,
        reset_at: window.reset_at,
        crossed_threshold: crossed(usage, usage_after, limit, thresholds),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::CredentialStatus;
    use crate::digest::SecretDigest;
    use crate::threshold::THRESHOLD_LADDER;
    use crate::types::PrincipalId;

    fn sibling(usage: u64, seq: u64) -> Credential {
        let mut c = Credential::new(
            PrincipalId::from("ada@example.com"),
            "key",
            SecretDigest::of(&uuid::Uuid::new_v4().to_string()),
        );
        c.usage_count = usage;
        c.window_seq = seq;
        c
    }

    fn window(seq: u64) -> WindowState {
        WindowState {
            seq,
            reset_at: Utc::now() + chrono::Duration::days(30),
        }
    }

    #[test]
    fn quota_window_duration() {
        assert_eq!(QuotaWindow::Daily.duration_seconds(), 86_400);
        assert_eq!(QuotaWindow::Weekly.duration_seconds(), 604_800);
        assert_eq!(QuotaWindow::Monthly.duration_seconds(), 2_592_000);
        assert_eq!(
            QuotaWindow::Custom { seconds: 7200 }.duration_seconds(),
            7200
        );
        assert_eq!(QuotaWindow::default(), QuotaWindow::Monthly);
    }

    #[test]
    fn quota_window_label() {
        assert_eq!(QuotaWindow::Monthly.label(), "monthly");
        assert_eq!(
            format!("{}", QuotaWindow::Custom { seconds: 300 }),
            "custom_300s"
        );
    }

    #[test]
    fn policy_deserializes_with_defaults() {
        let policy: QuotaPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy.limit, 10_000);
        assert_eq!(policy.window, QuotaWindow::Monthly);
    }

    #[test]
    fn window_expiry_and_successor() {
        let now = Utc::now();
        let w = WindowState::first(&QuotaWindow::Monthly, now);
        assert_eq!(w.seq, 1);
        assert!(!w.is_expired(now));
        assert!(!w.is_expired(w.reset_at));
        let later = w.reset_at + chrono::Duration::seconds(1);
        assert!(w.is_expired(later));
        let next = w.next(&QuotaWindow::Monthly, later);
        assert_eq!(next.seq, 2);
        assert_eq!(next.reset_at, later + chrono::Duration::days(30));
    }

    #[test]
    fn sums_only_active_siblings_in_current_window() {
        let mut suspended = sibling(500, 2);
        suspended.status = CredentialStatus::Suspended;
        let stale = sibling(900, 1);
        let live = sibling(10, 2);
        assert_eq!(aggregate_usage(&[suspended, stale, live], &window(2)), 10);
    }

    #[test]
    fn allows_last_call_and_reports_zero_remaining() {
        let a = sibling(5_000, 1);
        let b = sibling(4_999, 1);
        let id = a.id.clone();
        let decision = decide(&[a, b], &id, &window(1), 10_000, &THRESHOLD_LADDER);
        let QuotaDecision::Allow(grant) = decision else {
            panic!("expected allow");
        };
        assert_eq!(grant.usage_before, 9_999);
        assert_eq!(grant.usage_after, 10_000);
        assert_eq!(grant.remaining, 0);
        assert_eq!(grant.crossed_threshold, Some(100));
    }

    #[test]
    fn denies_once_limit_is_met() {
        let a = sibling(6_000, 1);
        let b = sibling(4_000, 1);
        let id = b.id.clone();
        assert_eq!(
            decide(&[a, b], &id, &window(1), 10_000, &THRESHOLD_LADDER),
            QuotaDecision::Exceeded {
                usage: 10_000,
                limit: 10_000
            }
        );
    }

    #[test]
    fn zero_limit_denies_everything() {
        let a = sibling(0, 1);
        let id = a.id.clone();
        assert!(matches!(
            decide(&[a], &id, &window(1), 0, &THRESHOLD_LADDER),
            QuotaDecision::Exceeded { .. }
        ));
    }

    #[test]
    fn presented_credential_must_be_an_active_sibling() {
        let a = sibling(1, 1);
        let mut b = sibling(1, 1);
        b.status = CredentialStatus::Expired;
        let b_id = b.id.clone();
        let siblings = [a, b];
        assert_eq!(
            decide(&siblings, &b_id, &window(1), 100, &THRESHOLD_LADDER),
            QuotaDecision::NotActive
        );
        assert_eq!(
            decide(
                &siblings,
                &CredentialId::from("cred_gone"),
                &window(1),
                100,
                &THRESHOLD_LADDER
            ),
            QuotaDecision::NotActive
        );
    }

    #[test]
    fn grant_reports_crossed_threshold() {
        let a = sibling(49, 1);
        let id = a.id.clone();
        let QuotaDecision::Allow(grant) = decide(&[a], &id, &window(1), 100, &THRESHOLD_LADDER)
        else {
            panic!("expected allow");
        };
        assert_eq!(grant.crossed_threshold, Some(50));
    }
}
