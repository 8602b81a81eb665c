use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use meter_core::{
    Credential, CredentialId, CredentialStatus, PrincipalId, QuotaWindow, SecretDigest,
    WindowState,
};
use meter_state::{CasResult, KeyKind, StateKey, StateStore};
use meter_stream::{InvalidationChannel, InvalidationMessage};

use crate::error::AuthorizerError;

/// Id of the single quota window record kept per principal.
const WINDOW_RECORD_ID: &str = "current";

/// Digest index entry: where the credential record for a digest lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DigestIndexEntry {
    principal: PrincipalId,
    credential_id: CredentialId,
}

fn credential_key(principal: &PrincipalId, id: &CredentialId) -> StateKey {
    StateKey::new(principal.as_str(), KeyKind::Credential, id.as_str())
}

fn digest_key(digest: &SecretDigest) -> StateKey {
    StateKey::global(KeyKind::DigestIndex, digest.as_str())
}

fn window_key(principal: &PrincipalId) -> StateKey {
    StateKey::new(principal.as_str(), KeyKind::QuotaWindow, WINDOW_RECORD_ID)
}

fn decode<T: serde::de::DeserializeOwned>(key: &StateKey, raw: &str) -> Result<T, AuthorizerError> {
    serde_json::from_str(raw).map_err(|source| AuthorizerError::CorruptRecord {
        key: key.canonical(),
        source,
    })
}

fn encode<T: Serialize>(key: &StateKey, value: &T) -> Result<String, AuthorizerError> {
    serde_json::to_string(value).map_err(|source| AuthorizerError::CorruptRecord {
        key: key.canonical(),
        source,
    })
}

/// Credential and quota window records on top of a [`StateStore`].
///
/// Every mutation that can change what a digest resolves to publishes an
/// `invalidate_key` message so other authorizer instances drop their cached
/// copy.
#[derive(Clone)]
pub struct CredentialRepository {
    store: Arc<dyn StateStore>,
    invalidation: Option<Arc<dyn InvalidationChannel>>,
    max_update_attempts: u32,
}

impl CredentialRepository {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            invalidation: None,
            max_update_attempts: 8,
        }
    }

    #[must_use]
    pub fn with_invalidation(mut self, channel: Arc<dyn InvalidationChannel>) -> Self {
        self.invalidation = Some(channel);
        self
    }

    #[must_use]
    pub fn with_max_update_attempts(mut self, attempts: u32) -> Self {
        self.max_update_attempts = attempts.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Register a new active credential for `principal` under `secret`.
    #[instrument(skip_all, fields(principal = %principal))]
    pub async fn create_credential(
        &self,
        principal: &PrincipalId,
        name: &str,
        secret: &str,
    ) -> Result<Credential, AuthorizerError> {
        let digest = SecretDigest::of(secret);
        let credential = Credential::new(principal.clone(), name, digest.clone());

        let index_key = digest_key(&digest);
        let entry = DigestIndexEntry {
            principal: principal.clone(),
            credential_id: credential.id.clone(),
        };
        if !self
            .store
            .check_and_set(&index_key, &encode(&index_key, &entry)?, None)
            .await?
        {
            return Err(AuthorizerError::DuplicateSecret);
        }

        self.put_credential(&credential).await?;
        debug!(credential_id = %credential.id, digest = %digest, "created credential");
        Ok(credential)
    }

    /// Write a credential record and its digest index entry as given,
    /// overwriting whatever is stored.
    pub async fn put_credential(&self, credential: &Credential) -> Result<(), AuthorizerError> {
        let key = credential_key(&credential.principal, &credential.id);
        self.store
            .set(&key, &encode(&key, credential)?, None)
            .await?;

        let index_key = digest_key(&credential.digest);
        let entry = DigestIndexEntry {
            principal: credential.principal.clone(),
            credential_id: credential.id.clone(),
        };
        self.store
            .set(&index_key, &encode(&index_key, &entry)?, None)
            .await?;
        self.publish_invalidation(&credential.digest).await;
        Ok(())
    }

    /// Resolve a secret digest to its credential record.
    #[instrument(skip_all, fields(digest = %digest))]
    pub async fn find_by_digest(
        &self,
        digest: &SecretDigest,
    ) -> Result<Option<Credential>, AuthorizerError> {
        let index_key = digest_key(digest);
        let Some(raw) = self.store.get(&index_key).await? else {
            return Ok(None);
        };
        let entry: DigestIndexEntry = decode(&index_key, &raw)?;
        self.get(&entry.principal, &entry.credential_id).await
    }

    pub async fn get(
        &self,
        principal: &PrincipalId,
        id: &CredentialId,
    ) -> Result<Option<Credential>, AuthorizerError> {
        let key = credential_key(principal, id);
        match self.store.get(&key).await? {
            Some(raw) => Ok(Some(decode(&key, &raw)?)),
            None => Ok(None),
        }
    }

    /// Every credential owned by `principal`, read straight from the store.
    #[instrument(skip_all, fields(principal = %principal))]
    pub async fn list_by_principal(
        &self,
        principal: &PrincipalId,
    ) -> Result<Vec<Credential>, AuthorizerError> {
        let entries = self
            .store
            .scan_keys(principal.as_str(), KeyKind::Credential, None)
            .await?;
        entries
            .iter()
            .map(|(key, raw)| decode(key, raw))
            .collect()
    }

    /// Change a credential's lifecycle status.
    #[instrument(skip_all, fields(principal = %principal, credential_id = %id, status = %status))]
    pub async fn set_status(
        &self,
        principal: &PrincipalId,
        id: &CredentialId,
        status: CredentialStatus,
    ) -> Result<Credential, AuthorizerError> {
        let updated = self
            .update(principal, id, |c| {
                c.status = status;
                true
            })
            .await?
            .ok_or_else(|| AuthorizerError::NotFound(id.to_string()))?;
        self.publish_invalidation(&updated.digest).await;
        Ok(updated)
    }

    /// Delete a credential and its digest index entry. Returns `false` if it
    /// did not exist.
    #[instrument(skip_all, fields(principal = %principal, credential_id = %id))]
    pub async fn delete_credential(
        &self,
        principal: &PrincipalId,
        id: &CredentialId,
    ) -> Result<bool, AuthorizerError> {
        let Some(existing) = self.get(principal, id).await? else {
            return Ok(false);
        };
        let existed = self.store.delete(&credential_key(principal, id)).await?;
        self.store.delete(&digest_key(&existing.digest)).await?;
        self.publish_invalidation(&existing.digest).await;
        Ok(existed)
    }

    /// The principal's current quota window, opening or rolling it over if
    /// needed.
    ///
    /// Concurrent callers agree on one window: the first window is claimed
    /// with a create-if-absent write and every rollover is a compare-and-swap
    /// on the window record, so an expired window is replaced exactly once.
    /// The single winner then stamps every sibling credential with the new
    /// reset date.
    #[instrument(skip_all, fields(principal = %principal))]
    pub async fn current_window(
        &self,
        principal: &PrincipalId,
        window: &QuotaWindow,
        now: DateTime<Utc>,
    ) -> Result<WindowState, AuthorizerError> {
        let key = window_key(principal);
        for _ in 0..self.max_update_attempts {
            match self.store.get_versioned(&key).await? {
                None => {
                    let first = WindowState::first(window, now);
                    if self
                        .store
                        .check_and_set(&key, &encode(&key, &first)?, None)
                        .await?
                    {
                        self.stamp_siblings(principal, &first).await;
                        return Ok(first);
                    }
                }
                Some((raw, version)) => {
                    let current: WindowState = decode(&key, &raw)?;
                    if !current.is_expired(now) {
                        return Ok(current);
                    }
                    let next = current.next(window, now);
                    if self
                        .store
                        .compare_and_swap(&key, version, &encode(&key, &next)?, None)
                        .await?
                        == CasResult::Ok
                    {
                        debug!(seq = next.seq, reset_at = %next.reset_at, "quota window rolled over");
                        self.stamp_siblings(principal, &next).await;
                        return Ok(next);
                    }
                }
            }
        }
        Err(AuthorizerError::Contention {
            key: key.canonical(),
            attempts: self.max_update_attempts,
        })
    }

    /// Zero every sibling credential into `state`. Counters of older windows
    /// already count as zero, so a failed stamp only leaves a stale display
    /// value behind.
    async fn stamp_siblings(&self, principal: &PrincipalId, state: &WindowState) {
        let siblings = match self.list_by_principal(principal).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "could not list credentials to stamp new window");
                return;
            }
        };
        for sibling in siblings.iter().filter(|c| c.is_active()) {
            let result = self
                .update(principal, &sibling.id, |c| c.reset_into(state.seq, state.reset_at))
                .await;
            if let Err(e) = result {
                warn!(credential_id = %sibling.id, error = %e, "failed to stamp credential with new window");
            }
        }
    }

    /// Count one call against `id` in `window`, provided the credential still
    /// exists and is active. Returns the updated record, or `None` when the
    /// condition failed.
    #[instrument(skip_all, fields(principal = %principal, credential_id = %id))]
    pub async fn record_call(
        &self,
        principal: &PrincipalId,
        id: &CredentialId,
        window: &WindowState,
        now: DateTime<Utc>,
    ) -> Result<Option<Credential>, AuthorizerError> {
        self.update(principal, id, |c| {
            if !c.is_active() {
                return false;
            }
            c.record_call(window.seq, window.reset_at, now);
            true
        })
        .await
    }

    /// Optimistic read-modify-write of one credential record.
    ///
    /// `mutate` returns `false` to abandon the update. Returns `None` if the
    /// record is missing or the update was abandoned.
    async fn update<F>(
        &self,
        principal: &PrincipalId,
        id: &CredentialId,
        mut mutate: F,
    ) -> Result<Option<Credential>, AuthorizerError>
    where
        F: FnMut(&mut Credential) -> bool + Send,
    {
        let key = credential_key(principal, id);
        for _ in 0..self.max_update_attempts {
            let Some((raw, version)) = self.store.get_versioned(&key).await? else {
                return Ok(None);
            };
            let mut credential: Credential = decode(&key, &raw)?;
            if !mutate(&mut credential) {
                return Ok(None);
            }
            match self
                .store
                .compare_and_swap(&key, version, &encode(&key, &credential)?, None)
                .await?
            {
                CasResult::Ok => return Ok(Some(credential)),
                // Deleted between the read and the write.
                CasResult::Conflict {
                    current_version: 0, ..
                } => return Ok(None),
                CasResult::Conflict { .. } => {}
            }
        }
        Err(AuthorizerError::Contention {
            key: key.canonical(),
            attempts: self.max_update_attempts,
        })
    }

    async fn publish_invalidation(&self, digest: &SecretDigest) {
        let Some(channel) = &self.invalidation else {
            return;
        };
        if let Err(e) = channel
            .publish(&InvalidationMessage::invalidate_key(digest.clone()))
            .await
        {
            warn!(digest = %digest, error = %e, "failed to publish cache invalidation");
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use meter_state_memory::MemoryStateStore;
    use meter_stream::{BroadcastInvalidationChannel, InvalidationChannel};

    use super::*;

    fn repo() -> CredentialRepository {
        CredentialRepository::new(Arc::new(MemoryStateStore::new()))
    }

    fn ada() -> PrincipalId {
        PrincipalId::from("ada@example.com")
    }

    #[tokio::test]
    async fn create_and_find_by_digest() {
        let repo = repo();
        let created = repo.create_credential(&ada(), "ci", "sk_live_1").await.unwrap();
        let found = repo
            .find_by_digest(&SecretDigest::of("sk_live_1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, created);
        assert!(
            repo.find_by_digest(&SecretDigest::of("sk_other"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn duplicate_secret_is_rejected() {
        let repo = repo();
        repo.create_credential(&ada(), "a", "sk_same").await.unwrap();
        let err = repo
            .create_credential(&PrincipalId::from("bob@example.com"), "b", "sk_same")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthorizerError::DuplicateSecret));
    }

    #[tokio::test]
    async fn list_by_principal_only_returns_owned_credentials() {
        let repo = repo();
        repo.create_credential(&ada(), "a", "sk_a1").await.unwrap();
        repo.create_credential(&ada(), "b", "sk_a2").await.unwrap();
        repo.create_credential(&PrincipalId::from("bob@example.com"), "c", "sk_b1")
            .await
            .unwrap();
        assert_eq!(repo.list_by_principal(&ada()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn mutations_publish_invalidations() {
        let channel = Arc::new(BroadcastInvalidationChannel::new("invalidation", 16));
        let mut sub = channel.subscribe();
        let repo = repo().with_invalidation(channel);

        let cred = repo.create_credential(&ada(), "a", "sk_inv").await.unwrap();
        assert_eq!(sub.recv().await, Some(cred.digest.clone()));

        repo.set_status(&ada(), &cred.id, CredentialStatus::Suspended)
            .await
            .unwrap();
        assert_eq!(sub.recv().await, Some(cred.digest.clone()));

        assert!(repo.delete_credential(&ada(), &cred.id).await.unwrap());
        assert_eq!(sub.recv().await, Some(cred.digest.clone()));
        assert!(repo.find_by_digest(&cred.digest).await.unwrap().is_none());
        assert!(!repo.delete_credential(&ada(), &cred.id).await.unwrap());
    }

    #[tokio::test]
    async fn record_call_requires_existing_active_credential() {
        let repo = repo();
        let now = Utc::now();
        let window = repo
            .current_window(&ada(), &QuotaWindow::Monthly, now)
            .await
            .unwrap();
        let cred = repo.create_credential(&ada(), "a", "sk_rc").await.unwrap();

        let updated = repo
            .record_call(&ada(), &cred.id, &window, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.usage_in_window(window.seq), 1);
        assert_eq!(updated.reset_at, Some(window.reset_at));

        repo.set_status(&ada(), &cred.id, CredentialStatus::Expired)
            .await
            .unwrap();
        assert!(
            repo.record_call(&ada(), &cred.id, &window, now)
                .await
                .unwrap()
                .is_none()
        );

        repo.delete_credential(&ada(), &cred.id).await.unwrap();
        assert!(
            repo.record_call(&ada(), &cred.id, &window, now)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn window_rolls_over_once_and_stamps_every_sibling() {
        let repo = repo();
        let start = Utc::now();
        let first = repo
            .current_window(&ada(), &QuotaWindow::Monthly, start)
            .await
            .unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(first.reset_at, start + TimeDelta::days(30));

        let a = repo.create_credential(&ada(), "a", "sk_w1").await.unwrap();
        let b = repo.create_credential(&ada(), "b", "sk_w2").await.unwrap();
        for _ in 0..3 {
            repo.record_call(&ada(), &a.id, &first, start).await.unwrap();
        }
        repo.record_call(&ada(), &b.id, &first, start).await.unwrap();

        // Same window until the reset date has passed.
        let same = repo
            .current_window(&ada(), &QuotaWindow::Monthly, first.reset_at)
            .await
            .unwrap();
        assert_eq!(same, first);

        let later = first.reset_at + TimeDelta::seconds(1);
        let repo_clone = repo.clone();
        let (pa, pb) = (ada(), ada());
        let (w1, w2) = tokio::join!(
            repo.current_window(&pa, &QuotaWindow::Monthly, later),
            repo_clone.current_window(&pb, &QuotaWindow::Monthly, later),
        );
        let (w1, w2) = (w1.unwrap(), w2.unwrap());
        assert_eq!(w1, w2, "concurrent callers must agree on the new window");
        assert_eq!(w1.seq, 2);
        assert_eq!(w1.reset_at, later + TimeDelta::days(30));

        for cred in repo.list_by_principal(&ada()).await.unwrap() {
            assert_eq!(cred.window_seq, 2);
            assert_eq!(cred.usage_count, 0);
            assert_eq!(cred.reset_at, Some(w1.reset_at));
        }

        // A call after the reset does not trigger another one.
        let again = repo
            .current_window(&ada(), &QuotaWindow::Monthly, later + TimeDelta::seconds(5))
            .await
            .unwrap();
        assert_eq!(again, w1);
    }

    #[tokio::test]
    async fn store_failures_surface_as_errors() {
        use meter_state::testing::FaultyStateStore;

        let faulty = Arc::new(FaultyStateStore::new(Arc::new(MemoryStateStore::new())));
        let repo = CredentialRepository::new(faulty.clone());
        faulty.fail_kind(&KeyKind::QuotaWindow);
        let err = repo
            .current_window(&ada(), &QuotaWindow::Monthly, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthorizerError::State(_)));
    }
}
