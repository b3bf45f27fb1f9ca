//! Cache & Memoization (spec §4.J): a generic LRU+TTL primitive plus four
//! named layers sitting in front of the model, retrieval, and embedding
//! calls, each independently disableable from `RuntimeProfile.cache`.

mod error;
mod in_memory;
mod layers;

pub use error::CacheError;
pub use in_memory::LruTtlCache;
pub use layers::{CacheLayers, EmbeddingCache, ExactCache, RetrievalCache, RetrievalCacheKey, SemanticCache};

use async_trait::async_trait;
use std::time::Duration;

/// Cache trait for key-value storage with optional per-entry TTL. Backs the
/// L1 exact, retrieval, and embedding layers; the L2 semantic layer looks up
/// by similarity instead and so has its own shape (`SemanticCache`).
#[async_trait]
pub trait Cache<K, V>: Send + Sync
where
    K: Send + Sync,
    V: Clone + Send + Sync,
{
    /// Returns `None` if the key is absent or its entry has expired.
    async fn get(&self, key: &K) -> Option<V>;

    /// `ttl = None` means the entry never expires on its own (still subject
    /// to LRU eviction).
    async fn set(&self, key: K, value: V, ttl: Option<Duration>) -> Result<(), CacheError>;

    async fn delete(&self, key: &K) -> Result<(), CacheError>;

    async fn clear(&self) -> Result<(), CacheError>;
}
