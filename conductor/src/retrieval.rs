//! Retrieval Engine: hybrid semantic + lexical search fused with Reciprocal
//! Rank Fusion, an optional cross-encoder rerank pass, and metadata filters
//! applied before fusion (spec §4.B).
//!
//! No teacher file retrieves a hybrid search engine directly; this module is
//! structured the way the corpus structures dual-backend delegation (an
//! aggregate that calls two async-trait-typed providers and combines their
//! output), with the RRF math taken directly from the spec.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::RetrievalError;
use crate::model::RetrievalItem;

/// RRF constant from spec §4.B step 4.
const RRF_C: f64 = 60.0;

#[derive(Debug, Clone, Default)]
pub struct RetrievalFilters {
    pub source: Option<String>,
    pub tenant: Option<String>,
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    pub until: Option<chrono::DateTime<chrono::Utc>>,
}

impl RetrievalFilters {
    fn matches(&self, item: &RetrievalItem) -> bool {
        if let Some(ref source) = self.source {
            if item.source != *source {
                return false;
            }
        }
        if let Some(ref tenant) = self.tenant {
            let item_tenant = item.metadata.get("tenant").and_then(|v| v.as_str());
            if item_tenant != Some(tenant.as_str()) {
                return false;
            }
        }
        true
    }
}

/// A ranked candidate from one backend, before fusion.
#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub item: RetrievalItem,
    pub score: f64,
}

/// Semantic (vector) nearest-neighbor search.
#[async_trait]
pub trait SemanticBackend: Send + Sync {
    async fn search(&self, query: &str, k: usize, filters: &RetrievalFilters) -> Result<Vec<RankedCandidate>, RetrievalError>;
}

/// Lexical (BM25-or-similar) search.
#[async_trait]
pub trait LexicalBackend: Send + Sync {
    async fn search(&self, query: &str, k: usize, filters: &RetrievalFilters) -> Result<Vec<RankedCandidate>, RetrievalError>;
}

/// Cross-encoder rerank hook; optional per spec §4.B step 5.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, items: Vec<RetrievalItem>) -> Result<Vec<RetrievalItem>, RetrievalError>;
}

pub struct RetrievalResult {
    pub items: Vec<RetrievalItem>,
    pub degraded: bool,
}

/// Combines a semantic and a lexical backend behind fusion. If a backend is
/// unavailable the engine returns the healthy side's results with
/// `degraded=true`; if both fail it returns `degraded=true` with an empty
/// list rather than an error (spec §4.B failure semantics).
pub struct RetrievalEngine {
    semantic: std::sync::Arc<dyn SemanticBackend>,
    lexical: std::sync::Arc<dyn LexicalBackend>,
    reranker: Option<std::sync::Arc<dyn Reranker>>,
}

impl RetrievalEngine {
    pub fn new(semantic: std::sync::Arc<dyn SemanticBackend>, lexical: std::sync::Arc<dyn LexicalBackend>) -> Self {
        Self {
            semantic,
            lexical,
            reranker: None,
        }
    }

    pub fn with_reranker(mut self, reranker: std::sync::Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub async fn search(&self, query: &str, top_k: usize, filters: &RetrievalFilters) -> RetrievalResult {
        let k1 = top_k * 4;
        let k2 = top_k * 4;

        let (semantic_result, lexical_result) =
            tokio::join!(self.semantic.search(query, k1, filters), self.lexical.search(query, k2, filters));

        let (semantic_candidates, semantic_ok) = match semantic_result {
            Ok(c) => (c, true),
            Err(_) => (Vec::new(), false),
        };
        let (lexical_candidates, lexical_ok) = match lexical_result {
            Ok(c) => (c, true),
            Err(_) => (Vec::new(), false),
        };

        let semantic_candidates: Vec<_> = semantic_candidates.into_iter().filter(|c| filters.matches(&c.item)).collect();
        let lexical_candidates: Vec<_> = lexical_candidates.into_iter().filter(|c| filters.matches(&c.item)).collect();

        let degraded = !(semantic_ok && lexical_ok);
        if !semantic_ok && !lexical_ok {
            return RetrievalResult { items: Vec::new(), degraded: true };
        }

        let mut fused = fuse(&semantic_candidates, &lexical_candidates);
        fused.truncate(top_k.max(1) * 2);

        let mut items: Vec<RetrievalItem> = fused.into_iter().map(|f| f.item).collect();

        if let Some(reranker) = &self.reranker {
            if let Ok(reranked) = reranker.rerank(query, items.clone()).await {
                items = reranked;
            }
        }

        items.truncate(top_k);
        RetrievalResult { items, degraded }
    }
}

struct FusedCandidate {
    item: RetrievalItem,
    fused_score: f64,
    semantic_score: Option<f64>,
}

/// Reciprocal Rank Fusion (spec §4.B step 4): for each candidate appearing at
/// rank `r` (0-based here, matching the spec's `1/(c+r)` with `c=60`) in
/// either list, accumulate `1/(c+r)`. Ties broken by semantic score, then by
/// docId.
fn fuse(semantic: &[RankedCandidate], lexical: &[RankedCandidate]) -> Vec<FusedCandidate> {
    let mut scores: HashMap<(String, String), f64> = HashMap::new();
    let mut items: HashMap<(String, String), RetrievalItem> = HashMap::new();
    let mut semantic_scores: HashMap<(String, String), f64> = HashMap::new();

    for (rank, candidate) in semantic.iter().enumerate() {
        let key = (candidate.item.doc_id.clone(), candidate.item.chunk_id.clone());
        *scores.entry(key.clone()).or_insert(0.0) += 1.0 / (RRF_C + rank as f64);
        semantic_scores.insert(key.clone(), candidate.score);
        items.entry(key).or_insert_with(|| candidate.item.clone());
    }
    for (rank, candidate) in lexical.iter().enumerate() {
        let key = (candidate.item.doc_id.clone(), candidate.item.chunk_id.clone());
        *scores.entry(key.clone()).or_insert(0.0) += 1.0 / (RRF_C + rank as f64);
        items.entry(key).or_insert_with(|| candidate.item.clone());
    }

    let mut fused: Vec<FusedCandidate> = scores
        .into_iter()
        .map(|(key, fused_score)| {
            let mut item = items.remove(&key).expect("every scored key has an item");
            let semantic_score = semantic_scores.get(&key).copied();
            item.score_semantic = semantic_score;
            item.score_lexical = lexical
                .iter()
                .find(|c| (c.item.doc_id.clone(), c.item.chunk_id.clone()) == key)
                .map(|c| c.score);
            item.score_fused = fused_score;
            FusedCandidate {
                item,
                fused_score,
                semantic_score,
            }
        })
        .collect();

    fused.sort_by(|a, b| {
        b.fused_score
            .partial_cmp(&a.fused_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.semantic_score
                    .unwrap_or(0.0)
                    .partial_cmp(&a.semantic_score.unwrap_or(0.0))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.item.doc_id.cmp(&b.item.doc_id))
    });

    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(doc: &str, text: &str) -> RetrievalItem {
        RetrievalItem {
            doc_id: doc.to_string(),
            chunk_id: "c0".to_string(),
            text: text.to_string(),
            source: "test".to_string(),
            score_semantic: None,
            score_lexical: None,
            score_fused: 0.0,
            metadata: serde_json::json!({}),
        }
    }

    struct StubSemantic(Vec<RankedCandidate>);
    #[async_trait]
    impl SemanticBackend for StubSemantic {
        async fn search(&self, _q: &str, _k: usize, _f: &RetrievalFilters) -> Result<Vec<RankedCandidate>, RetrievalError> {
            Ok(self.0.clone())
        }
    }

    struct StubLexical(Vec<RankedCandidate>);
    #[async_trait]
    impl LexicalBackend for StubLexical {
        async fn search(&self, _q: &str, _k: usize, _f: &RetrievalFilters) -> Result<Vec<RankedCandidate>, RetrievalError> {
            Ok(self.0.clone())
        }
    }

    /// **Scenario (spec §8 property 6)**: an item appearing in both lists
    /// ranks no worse than the better of its two ranks.
    #[tokio::test]
    async fn item_in_both_lists_outranks_single_list_items() {
        let shared = item("doc-shared", "in both lists");
        let semantic_only = item("doc-semantic-only", "semantic only");
        let lexical_only = item("doc-lexical-only", "lexical only");

        let semantic = std::sync::Arc::new(StubSemantic(vec![
            RankedCandidate { item: shared.clone(), score: 0.9 },
            RankedCandidate { item: semantic_only.clone(), score: 0.8 },
        ]));
        let lexical = std::sync::Arc::new(StubLexical(vec![
            RankedCandidate { item: shared.clone(), score: 5.0 },
            RankedCandidate { item: lexical_only.clone(), score: 4.0 },
        ]));

        let engine = RetrievalEngine::new(semantic, lexical);
        let result = engine.search("q", 3, &RetrievalFilters::default()).await;
        assert!(!result.degraded);
        assert_eq!(result.items[0].doc_id, "doc-shared");
    }

    #[tokio::test]
    async fn one_backend_down_returns_degraded_with_healthy_results() {
        struct FailingSemantic;
        #[async_trait]
        impl SemanticBackend for FailingSemantic {
            async fn search(&self, _q: &str, _k: usize, _f: &RetrievalFilters) -> Result<Vec<RankedCandidate>, RetrievalError> {
                Err(RetrievalError::Degraded { reason: "down".into() })
            }
        }
        let lexical = std::sync::Arc::new(StubLexical(vec![RankedCandidate { item: item("d1", "t"), score: 1.0 }]));
        let engine = RetrievalEngine::new(std::sync::Arc::new(FailingSemantic), lexical);
        let result = engine.search("q", 3, &RetrievalFilters::default()).await;
        assert!(result.degraded);
        assert_eq!(result.items.len(), 1);
    }

    #[tokio::test]
    async fn both_backends_down_returns_degraded_empty_list() {
        struct FailingSemantic;
        #[async_trait]
        impl SemanticBackend for FailingSemantic {
            async fn search(&self, _q: &str, _k: usize, _f: &RetrievalFilters) -> Result<Vec<RankedCandidate>, RetrievalError> {
                Err(RetrievalError::BothBackendsDown)
            }
        }
        struct FailingLexical;
        #[async_trait]
        impl LexicalBackend for FailingLexical {
            async fn search(&self, _q: &str, _k: usize, _f: &RetrievalFilters) -> Result<Vec<RankedCandidate>, RetrievalError> {
                Err(RetrievalError::BothBackendsDown)
            }
        }
        let engine = RetrievalEngine::new(std::sync::Arc::new(FailingSemantic), std::sync::Arc::new(FailingLexical));
        let result = engine.search("q", 3, &RetrievalFilters::default()).await;
        assert!(result.degraded);
        assert!(result.items.is_empty());
    }

    #[tokio::test]
    async fn empty_results_are_not_an_error() {
        let engine = RetrievalEngine::new(
            std::sync::Arc::new(StubSemantic(vec![])),
            std::sync::Arc::new(StubLexical(vec![])),
        );
        let result = engine.search("q", 3, &RetrievalFilters::default()).await;
        assert!(!result.degraded);
        assert!(result.items.is_empty());
    }
}
