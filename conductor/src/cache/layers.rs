//! The four named cache layers of spec §4.J. Each wraps the generic LRU+TTL
//! primitive (or, for the semantic layer, a similarity scan) and can be
//! disabled independently via `RuntimeProfile.cache`.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::model::RetrievalItem;

use super::in_memory::LruTtlCache;
use super::Cache;

/// L1 exact-match cache: key = normalized prompt + params fingerprint, small
/// capacity, short TTL. A hit skips the model call entirely.
pub struct ExactCache {
    inner: Option<LruTtlCache<String, String>>,
    ttl: Option<Duration>,
}

impl ExactCache {
    pub fn new(capacity: usize, ttl: Option<Duration>, enabled: bool) -> Self {
        Self { inner: enabled.then(|| LruTtlCache::new(capacity)), ttl }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        match &self.inner {
            Some(cache) => cache.get(&key.to_string()).await,
            None => None,
        }
    }

    pub async fn set(&self, key: String, value: String) {
        if let Some(cache) = &self.inner {
            let _ = cache.set(key, value, self.ttl).await;
        }
    }
}

/// L2 semantic cache: key is an embedding vector, looked up by cosine
/// similarity above a threshold rather than exact match, so unlike the other
/// three layers it can't be expressed behind the generic `Cache<K, V>` trait.
struct SemanticEntry {
    embedding: Vec<f64>,
    value: String,
    expires_at: Option<Instant>,
    last_used: Instant,
}

pub struct SemanticCache {
    entries: Mutex<Vec<SemanticEntry>>,
    capacity: usize,
    threshold: f64,
    ttl: Option<Duration>,
    enabled: bool,
}

impl SemanticCache {
    pub fn new(capacity: usize, threshold: f64, ttl: Option<Duration>, enabled: bool) -> Self {
        Self { entries: Mutex::new(Vec::new()), capacity: capacity.max(1), threshold, ttl, enabled }
    }

    pub async fn get(&self, embedding: &[f64]) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        entries.retain(|e| !matches!(e.expires_at, Some(deadline) if now >= deadline));

        let best = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (i, cosine_similarity(embedding, &e.embedding)))
            .filter(|(_, sim)| *sim >= self.threshold)
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        if let Some((idx, _)) = best {
            entries[idx].last_used = now;
            Some(entries[idx].value.clone())
        } else {
            None
        }
    }

    pub async fn set(&self, embedding: Vec<f64>, value: String) {
        if !self.enabled {
            return;
        }
        let mut entries = self.entries.lock().await;
        if entries.len() >= self.capacity {
            if let Some((idx, _)) = entries.iter().enumerate().min_by_key(|(_, e)| e.last_used) {
                entries.remove(idx);
            }
        }
        entries.push(SemanticEntry {
            embedding,
            value,
            expires_at: self.ttl.map(|d| Instant::now() + d),
            last_used: Instant::now(),
        });
    }
}

fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Retrieval cache: key = {corpus, normalized query, filters fingerprint},
/// moderate TTL — avoids re-running hybrid search for a repeated question.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RetrievalCacheKey {
    pub corpus: String,
    pub normalized_query: String,
    pub filters_fingerprint: String,
}

pub struct RetrievalCache {
    inner: Option<LruTtlCache<RetrievalCacheKey, Vec<RetrievalItem>>>,
    ttl: Option<Duration>,
}

impl RetrievalCache {
    pub fn new(capacity: usize, ttl: Option<Duration>, enabled: bool) -> Self {
        Self { inner: enabled.then(|| LruTtlCache::new(capacity)), ttl }
    }

    pub async fn get(&self, key: &RetrievalCacheKey) -> Option<Vec<RetrievalItem>> {
        match &self.inner {
            Some(cache) => cache.get(key).await,
            None => None,
        }
    }

    pub async fn set(&self, key: RetrievalCacheKey, items: Vec<RetrievalItem>) {
        if let Some(cache) = &self.inner {
            let _ = cache.set(key, items, self.ttl).await;
        }
    }
}

/// Embedding cache: key = normalized text + model id, large capacity, pure
/// LRU with no TTL (an embedding for a given text+model never changes).
pub struct EmbeddingCache {
    inner: Option<LruTtlCache<String, Vec<f64>>>,
}

impl EmbeddingCache {
    pub fn new(capacity: usize, enabled: bool) -> Self {
        Self { inner: enabled.then(|| LruTtlCache::new(capacity)) }
    }

    fn key(text: &str, model: &str) -> String {
        format!("{model}::{text}")
    }

    pub async fn get(&self, text: &str, model: &str) -> Option<Vec<f64>> {
        match &self.inner {
            Some(cache) => cache.get(&Self::key(text, model)).await,
            None => None,
        }
    }

    pub async fn set(&self, text: &str, model: &str, embedding: Vec<f64>) {
        if let Some(cache) = &self.inner {
            let _ = cache.set(Self::key(text, model), embedding, None).await;
        }
    }
}

/// Bundles the four layers, built from a validated `RuntimeProfile.cache`.
pub struct CacheLayers {
    pub l1_exact: ExactCache,
    pub l2_semantic: SemanticCache,
    pub retrieval: RetrievalCache,
    pub embedding: EmbeddingCache,
}

impl CacheLayers {
    pub fn from_config(cfg: &env_config::CacheConfig) -> Self {
        Self {
            l1_exact: ExactCache::new(
                cfg.l1_exact.capacity,
                cfg.l1_exact.ttl_ms.map(Duration::from_millis),
                cfg.l1_exact.enabled,
            ),
            l2_semantic: SemanticCache::new(
                cfg.l2_semantic.capacity,
                cfg.l2_threshold,
                cfg.l2_semantic.ttl_ms.map(Duration::from_millis),
                cfg.l2_semantic.enabled,
            ),
            retrieval: RetrievalCache::new(
                cfg.retrieval.capacity,
                cfg.retrieval.ttl_ms.map(Duration::from_millis),
                cfg.retrieval.enabled,
            ),
            embedding: EmbeddingCache::new(cfg.embedding.capacity, cfg.embedding.enabled),
        }
    }
}
