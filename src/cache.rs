//! Cache-aside for read paths. Callers build the key, pick the TTL, and
//! invalidate explicitly after writes; nothing is cached implicitly.

use std::future::Future;
use std::hash::Hash;

use dashmap::DashMap;
use ulid::Ulid;

use crate::model::{Ms, Span};

pub struct TtlCache<K, V> {
    entries: DashMap<K, (V, Ms)>,
}

impl<K: Eq + Hash, V: Clone> Default for TtlCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, key: &K, now: Ms) -> Option<V> {
        let hit = self.entries.get(key)?;
        let (value, expires_at) = hit.value();
        (*expires_at > now).then(|| value.clone())
    }

    pub fn insert(&self, key: K, value: V, now: Ms, ttl: Ms) {
        if ttl > 0 {
            self.entries.insert(key, (value, now + ttl));
        }
    }

    pub fn invalidate_where(&self, stale: impl Fn(&K) -> bool) {
        self.entries.retain(|k, _| !stale(k));
    }

    /// Drop expired entries.
    pub fn evict_expired(&self, now: Ms) {
        self.entries.retain(|_, (_, expires_at)| *expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Return the cached value or compute, store, and return it. Errors are not cached.
pub async fn cached<K, V, E, F, Fut>(
    cache: &TtlCache<K, V>,
    key: K,
    now: Ms,
    ttl: Ms,
    compute: F,
) -> Result<V, E>
where
    K: Eq + Hash,
    V: Clone,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<V, E>>,
{
    if let Some(hit) = cache.get(&key, now) {
        return Ok(hit);
    }
    let value = compute().await?;
    cache.insert(key, value.clone(), now, ttl);
    Ok(value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AvailabilityKey {
    pub resource_id: Ulid,
    pub span: Span,
    pub units: u32,
}

pub fn availability_key(resource_id: Ulid, span: Span, units: u32) -> AvailabilityKey {
    AvailabilityKey {
        resource_id,
        span,
        units,
    }
}
