use std::time::Duration;

use moka::future::Cache;
use tokio::time::Instant;

use meter_core::{Credential, SecretDigest};

#[derive(Debug, Clone)]
struct CachedCredential {
    credential: Credential,
    cached_at: Instant,
}

/// Short-lived lookup from secret digest to credential record.
///
/// Safe for concurrent use. Invalidation messages can race with in-flight
/// reads, so every entry also expires after `ttl`; the age is checked on each
/// read and the cache's own eviction only bounds memory.
#[derive(Debug, Clone)]
pub struct QuotaCache {
    entries: Cache<SecretDigest, CachedCredential>,
    ttl: Duration,
}

impl QuotaCache {
    pub fn new(ttl: Duration, capacity: u64) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
            ttl,
        }
    }

    /// Cached credential for `digest` if present and younger than the TTL.
    pub async fn get(&self, digest: &SecretDigest) -> Option<Credential> {
        let cached = self.entries.get(digest).await?;
        if cached.cached_at.elapsed() > self.ttl {
            self.entries.invalidate(digest).await;
            return None;
        }
        Some(cached.credential)
    }

    pub async fn insert(&self, digest: SecretDigest, credential: Credential) {
        self.entries
            .insert(
                digest,
                CachedCredential {
                    credential,
                    cached_at: Instant::now(),
                },
            )
            .await;
    }

    pub async fn invalidate(&self, digest: &SecretDigest) {
        self.entries.invalidate(digest).await;
    }

    /// Run the cache's deferred maintenance (evictions, expirations).
    pub async fn run_pending_tasks(&self) {
        self.entries.run_pending_tasks().await;
    }

    /// Approximate number of cached entries.
    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[cfg(test)]
mod tests {
    use meter_core::PrincipalId;

    use super::*;

    fn credential(secret: &str) -> (SecretDigest, Credential) {
        let digest = SecretDigest::of(secret);
        let cred = Credential::new(PrincipalId::from("ada@example.com"), "k", digest.clone());
        (digest, cred)
    }

    #[tokio::test]
    async fn hit_after_insert_and_miss_after_invalidate() {
        let cache = QuotaCache::new(Duration::from_secs(30), 100);
        let (digest, cred) = credential("sk_1");
        assert!(cache.get(&digest).await.is_none());

        cache.insert(digest.clone(), cred.clone()).await;
        assert_eq!(cache.get(&digest).await, Some(cred));

        cache.invalidate(&digest).await;
        assert!(cache.get(&digest).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_older_than_ttl_are_not_served() {
        let cache = QuotaCache::new(Duration::from_secs(30), 100);
        let (digest, cred) = credential("sk_2");
        cache.insert(digest.clone(), cred).await;

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(cache.get(&digest).await.is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get(&digest).await.is_none());
    }
}
