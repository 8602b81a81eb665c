use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use meter_state::error::StateError;
use meter_state::key::{KeyKind, StateKey};
use meter_state::store::{CasResult, StateStore};

/// A single entry in the in-memory store.
#[derive(Debug, Clone)]
struct Entry {
    key: StateKey,
    value: String,
    version: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(key: &StateKey, value: String, expires_at: Option<Instant>) -> Self {
        Self {
            key: key.clone(),
            value,
            version: 1,
            expires_at,
        }
    }

    /// Returns `true` if this entry has passed its TTL deadline.
    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// Compute the expiry instant from an optional TTL duration.
fn expiry_from_ttl(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|d| Instant::now() + d)
}

fn parse_counter(value: &str) -> Result<i64, StateError> {
    value.parse().map_err(|e: std::num::ParseIntError| {
        StateError::Serialization(format!("counter value is not an integer: {e}"))
    })
}

/// In-memory [`StateStore`] backed by a [`DashMap`].
///
/// Entries are lazily evicted on read when their TTL has elapsed;
/// [`sweep_expired`](Self::sweep_expired) drops the rest. This
/// implementation is fully synchronous internally; the async trait methods
/// return immediately.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    data: DashMap<String, Entry>,
}

impl MemoryStateStore {
    /// Create a new, empty in-memory state store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently held, expired ones included.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Remove every expired entry. Returns how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        let before = self.data.len();
        self.data.retain(|_, entry| !entry.is_expired());
        let removed = before.saturating_sub(self.data.len());
        if removed > 0 {
            tracing::debug!(removed, "swept expired state entries");
        }
        removed
    }

    /// Render a [`StateKey`] into the string used as the map key.
    fn render_key(key: &StateKey) -> String {
        key.canonical()
    }

    fn evict_if_expired(&self, rendered: &str) {
        self.data.remove_if(rendered, |_, entry| entry.is_expired());
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn check_and_set(
        &self,
        key: &StateKey,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StateError> {
        let rendered = Self::render_key(key);
        self.evict_if_expired(&rendered);

        // Use `entry` API for atomicity: only insert if vacant.
        let was_inserted = match self.data.entry(rendered) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Entry::new(key, value.to_owned(), expiry_from_ttl(ttl)));
                true
            }
        };

        Ok(was_inserted)
    }

    async fn get(&self, key: &StateKey) -> Result<Option<String>, StateError> {
        Ok(self.get_versioned(key).await?.map(|(value, _)| value))
    }

    async fn get_versioned(&self, key: &StateKey) -> Result<Option<(String, u64)>, StateError> {
        let rendered = Self::render_key(key);

        // Lazy TTL eviction: check and remove if expired.
        if let Some(entry) = self.data.get(&rendered) {
            if entry.is_expired() {
                drop(entry);
                self.evict_if_expired(&rendered);
                return Ok(None);
            }
            return Ok(Some((entry.value.clone(), entry.version)));
        }

        Ok(None)
    }

    async fn set(
        &self,
        key: &StateKey,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StateError> {
        let rendered = Self::render_key(key);
        let expires_at = expiry_from_ttl(ttl);

        self.data
            .entry(rendered)
            .and_modify(|entry| {
                value.clone_into(&mut entry.value);
                entry.version += 1;
                entry.expires_at = expires_at;
            })
            .or_insert_with(|| Entry::new(key, value.to_owned(), expires_at));

        Ok(())
    }

    async fn delete(&self, key: &StateKey) -> Result<bool, StateError> {
        let rendered = Self::render_key(key);

        // Remove, but treat expired entries as "not found".
        match self.data.remove(&rendered) {
            Some((_, entry)) => Ok(!entry.is_expired()),
            None => Ok(false),
        }
    }

    async fn increment(
        &self,
        key: &StateKey,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, StateError> {
        let rendered = Self::render_key(key);
        let expires_at = expiry_from_ttl(ttl);

        // Remove any expired entry first so the counter starts fresh.
        self.evict_if_expired(&rendered);

        let mut ref_mut = self
            .data
            .entry(rendered)
            .or_insert_with(|| Entry::new(key, "0".to_owned(), expires_at));

        let new_value = parse_counter(&ref_mut.value)? + delta;
        ref_mut.value = new_value.to_string();
        ref_mut.version += 1;
        if let Some(ea) = expires_at {
            ref_mut.expires_at = Some(ea);
        }

        Ok(new_value)
    }

    async fn compare_and_swap(
        &self,
        key: &StateKey,
        expected_version: u64,
        new_value: &str,
        ttl: Option<Duration>,
    ) -> Result<CasResult, StateError> {
        let rendered = Self::render_key(key);

        // Remove expired entries so they appear as missing.
        self.evict_if_expired(&rendered);

        let Some(mut entry) = self.data.get_mut(&rendered) else {
            return Ok(CasResult::Conflict {
                current_value: None,
                current_version: 0,
            });
        };

        if entry.version != expected_version {
            return Ok(CasResult::Conflict {
                current_value: Some(entry.value.clone()),
                current_version: entry.version,
            });
        }

        new_value.clone_into(&mut entry.value);
        entry.version += 1;
        entry.expires_at = expiry_from_ttl(ttl).or(entry.expires_at);

        Ok(CasResult::Ok)
    }

    async fn scan_keys(
        &self,
        scope: &str,
        kind: KeyKind,
        prefix: Option<&str>,
    ) -> Result<Vec<(StateKey, String)>, StateError> {
        let prefix = prefix.unwrap_or("");
        Ok(self
            .data
            .iter()
            .filter(|e| {
                let entry = e.value();
                !entry.is_expired()
                    && entry.key.scope == scope
                    && entry.key.kind == kind
                    && entry.key.id.starts_with(prefix)
            })
            .map(|e| (e.value().key.clone(), e.value().value.clone()))
            .collect())
    }
}
