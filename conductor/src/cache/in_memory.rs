//! `LruTtlCache`: an LRU eviction policy (the `lru` crate) layered with a
//! per-entry TTL checked lazily on `get` (spec §4.J). No background sweeper —
//! an expired entry is evicted the next time it's looked up or the LRU
//! itself reclaims the slot for a newer entry, whichever comes first.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::Mutex;

use super::{Cache, CacheError};

struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
}

pub struct LruTtlCache<K, V> {
    inner: Mutex<LruCache<K, Entry<V>>>,
}

impl<K, V> LruTtlCache<K, V>
where
    K: Hash + Eq,
{
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity > 0");
        Self { inner: Mutex::new(LruCache::new(capacity)) }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

#[async_trait]
impl<K, V> Cache<K, V> for LruTtlCache<K, V>
where
    K: Hash + Eq + Send + Sync,
    V: Clone + Send + Sync,
{
    async fn get(&self, key: &K) -> Option<V> {
        let mut guard = self.inner.lock().await;
        let expired = match guard.peek(key) {
            Some(entry) => matches!(entry.expires_at, Some(deadline) if Instant::now() >= deadline),
            None => return None,
        };
        if expired {
            guard.pop(key);
            return None;
        }
        guard.get(key).map(|entry| entry.value.clone())
    }

    async fn set(&self, key: K, value: V, ttl: Option<Duration>) -> Result<(), CacheError> {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.inner.lock().await.put(key, Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &K) -> Result<(), CacheError> {
        self.inner.lock().await.pop(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.inner.lock().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: a value set with no TTL survives indefinitely and a
    /// capacity-1 cache evicts the least-recently-used entry on overflow.
    #[tokio::test]
    async fn lru_eviction_drops_the_oldest_entry() {
        let cache: LruTtlCache<&str, i32> = LruTtlCache::new(1);
        cache.set("a", 1, None).await.unwrap();
        cache.set("b", 2, None).await.unwrap();
        assert_eq!(cache.get(&"a").await, None);
        assert_eq!(cache.get(&"b").await, Some(2));
    }

    /// **Scenario**: an entry past its TTL is treated as absent on the next
    /// `get`, even though the LRU itself never reaped it.
    #[tokio::test]
    async fn expired_entry_reads_as_absent() {
        let cache: LruTtlCache<&str, i32> = LruTtlCache::new(8);
        cache.set("a", 1, Some(Duration::from_millis(5))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get(&"a").await, None);
    }

    #[tokio::test]
    async fn delete_and_clear_remove_entries() {
        let cache: LruTtlCache<&str, i32> = LruTtlCache::new(8);
        cache.set("a", 1, None).await.unwrap();
        cache.set("b", 2, None).await.unwrap();
        cache.delete(&"a").await.unwrap();
        assert_eq!(cache.get(&"a").await, None);
        cache.clear().await.unwrap();
        assert_eq!(cache.get(&"b").await, None);
        assert_eq!(cache.len().await, 0);
    }
}
