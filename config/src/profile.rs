//! Validated, live-reloadable runtime configuration (feature flags & config).
//!
//! `RuntimeProfile` is the typed document every tunable constant loads from:
//! timeouts, pool sizes, cache limits, confidence thresholds, and delivery
//! profiles. [`RuntimeProfile::validate`] enforces the timeout hierarchy and
//! rejects unknown agent/tool names before any query can run.
//! [`ProfileReloader`] exposes a `tokio::sync::watch` channel so a reload only
//! affects queries started after it: each query takes its own `Arc` clone of
//! the profile at start, and a later reload never mutates that clone.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("read profile file: {0}")]
    Read(std::io::Error),
    #[error("parse profile toml: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config violates timeout hierarchy: {0}")]
    TimeoutHierarchy(String),
    #[error("config references unknown agent: {0}")]
    UnknownAgent(String),
    #[error("config references unknown tool: {0}")]
    UnknownTool(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub deadline_ms: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self { deadline_ms: 30_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanConfig {
    pub max_steps: usize,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self { max_steps: 16 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    pub default_timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self { default_timeout_ms: 10_000, max_retries: 1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolAgentConfig {
    pub max_concurrent: usize,
    #[serde(default)]
    pub min_idle: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheLayerConfig {
    pub capacity: usize,
    pub ttl_ms: Option<u64>,
    pub enabled: bool,
}

impl Default for CacheLayerConfig {
    fn default() -> Self {
        Self { capacity: 1024, ttl_ms: Some(60_000), enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub l1_exact: CacheLayerConfig,
    pub l2_semantic: CacheLayerConfig,
    pub l2_threshold: f64,
    pub retrieval: CacheLayerConfig,
    pub embedding: CacheLayerConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_exact: CacheLayerConfig { capacity: 256, ttl_ms: Some(30_000), enabled: true },
            l2_semantic: CacheLayerConfig { capacity: 256, ttl_ms: Some(300_000), enabled: true },
            l2_threshold: 0.95,
            retrieval: CacheLayerConfig { capacity: 512, ttl_ms: Some(120_000), enabled: true },
            embedding: CacheLayerConfig { capacity: 8192, ttl_ms: None, enabled: true },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketThresholds {
    pub very_high: f64,
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

impl Default for BucketThresholds {
    fn default() -> Self {
        Self { very_high: 0.85, high: 0.7, medium: 0.5, low: 0.3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RawScoreWeightsConfig {
    pub hedging: f64,
    pub contradiction: f64,
    pub citation: f64,
    pub agreement: f64,
}

impl Default for RawScoreWeightsConfig {
    fn default() -> Self {
        Self { hedging: 0.25, contradiction: 0.25, citation: 0.25, agreement: 0.25 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceConfig {
    pub buckets: BucketThresholds,
    pub raw_score_weights: RawScoreWeightsConfig,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self { buckets: BucketThresholds::default(), raw_score_weights: RawScoreWeightsConfig::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub rerank_enabled: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self { top_k: 8, rerank_enabled: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub default: String,
    pub timeout_ms: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self { default: "gpt-4o-mini".to_string(), timeout_ms: 8_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

/// The full validated configuration document (spec §4.K / §6). Deserialized
/// from TOML; every field also has a default so a partial document is valid.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeProfile {
    pub query: QueryConfig,
    pub plan: PlanConfig,
    pub step: StepConfig,
    pub pool: HashMap<String, PoolAgentConfig>,
    pub cache: CacheConfig,
    pub confidence: ConfidenceConfig,
    pub retrieval: RetrievalConfig,
    pub model: ModelConfig,
    pub logging: LoggingConfig,
}

impl RuntimeProfile {
    pub fn from_toml_str(s: &str) -> Result<Self, ProfileError> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ProfileError> {
        let content = std::fs::read_to_string(path).map_err(ProfileError::Read)?;
        Self::from_toml_str(&content)
    }

    /// Enforces the timeout hierarchy (`step.defaultTimeoutMs <=
    /// query.deadlineMs`, `model.timeoutMs <= step.defaultTimeoutMs`) and
    /// rejects any `pool.<agent>` entry naming something the caller didn't
    /// register, per spec §4.K / §4.G. `known_tools` is accepted for
    /// forward compatibility with a future per-agent tool allowlist; today's
    /// `RuntimeProfile` has no field that names a tool, so it is unused.
    pub fn validate(&self, known_agents: &HashSet<String>, known_tools: &HashSet<String>) -> Result<(), ProfileError> {
        if self.step.default_timeout_ms as u64 > self.query.deadline_ms {
            return Err(ProfileError::TimeoutHierarchy(format!(
                "step.default_timeout_ms ({}) exceeds query.deadline_ms ({})",
                self.step.default_timeout_ms, self.query.deadline_ms
            )));
        }
        if self.model.timeout_ms > self.step.default_timeout_ms {
            return Err(ProfileError::TimeoutHierarchy(format!(
                "model.timeout_ms ({}) exceeds step.default_timeout_ms ({})",
                self.model.timeout_ms, self.step.default_timeout_ms
            )));
        }
        for name in self.pool.keys() {
            if !known_agents.contains(name) {
                return Err(ProfileError::UnknownAgent(name.clone()));
            }
        }
        let _ = known_tools; // reserved for callers that pass step-selection tool names
        Ok(())
    }
}

/// Live-reload handle: `current()` returns the latest validated snapshot;
/// `reload` atomically swaps in a newly-validated one. A query takes its own
/// `Arc<RuntimeProfile>` once at start via `current()` and keeps that clone
/// for its entire lifetime, so an in-flight query is unaffected by a reload
/// that lands mid-execution (spec §4.K: "changes apply to new queries only").
pub struct ProfileReloader {
    sender: tokio::sync::watch::Sender<Arc<RuntimeProfile>>,
}

impl ProfileReloader {
    pub fn new(initial: RuntimeProfile) -> Self {
        let (sender, _receiver) = tokio::sync::watch::channel(Arc::new(initial));
        Self { sender }
    }

    pub fn current(&self) -> Arc<RuntimeProfile> {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<Arc<RuntimeProfile>> {
        self.sender.subscribe()
    }

    /// Validates `next` before publishing it; a bad reload leaves the
    /// previous snapshot in place and returns the validation error.
    pub fn reload(
        &self,
        next: RuntimeProfile,
        known_agents: &HashSet<String>,
        known_tools: &HashSet<String>,
    ) -> Result<(), ProfileError> {
        next.validate(known_agents, known_tools)?;
        self.sender.send_replace(Arc::new(next));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_satisfies_timeout_hierarchy() {
        let profile = RuntimeProfile::default();
        let agents = HashSet::new();
        let tools = HashSet::new();
        assert!(profile.validate(&agents, &tools).is_ok());
    }

    #[test]
    fn step_timeout_exceeding_query_deadline_is_rejected() {
        let mut profile = RuntimeProfile::default();
        profile.query.deadline_ms = 1_000;
        profile.step.default_timeout_ms = 5_000;
        let err = profile.validate(&HashSet::new(), &HashSet::new()).unwrap_err();
        assert!(matches!(err, ProfileError::TimeoutHierarchy(_)));
    }

    #[test]
    fn model_timeout_exceeding_step_timeout_is_rejected() {
        let mut profile = RuntimeProfile::default();
        profile.step.default_timeout_ms = 1_000;
        profile.model.timeout_ms = 2_000;
        let err = profile.validate(&HashSet::new(), &HashSet::new()).unwrap_err();
        assert!(matches!(err, ProfileError::TimeoutHierarchy(_)));
    }

    #[test]
    fn unknown_pool_agent_name_is_rejected() {
        let mut profile = RuntimeProfile::default();
        profile.pool.insert("ghost".to_string(), PoolAgentConfig { max_concurrent: 1, min_idle: 0 });
        let agents: HashSet<String> = ["writer".to_string()].into_iter().collect();
        let err = profile.validate(&agents, &HashSet::new()).unwrap_err();
        assert!(matches!(err, ProfileError::UnknownAgent(_)));
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let toml = "[query]\ndeadline_ms = 5000\n";
        let profile = RuntimeProfile::from_toml_str(toml).unwrap();
        assert_eq!(profile.query.deadline_ms, 5000);
        assert_eq!(profile.plan.max_steps, 16);
    }

    #[tokio::test]
    async fn reload_is_invisible_to_a_snapshot_already_taken() {
        let reloader = ProfileReloader::new(RuntimeProfile::default());
        let snapshot = reloader.current();
        assert_eq!(snapshot.query.deadline_ms, 30_000);

        let mut next = RuntimeProfile::default();
        next.query.deadline_ms = 99_999;
        reloader.reload(next, &HashSet::new(), &HashSet::new()).unwrap();

        // The previously-taken snapshot is untouched; a fresh `current()` sees the update.
        assert_eq!(snapshot.query.deadline_ms, 30_000);
        assert_eq!(reloader.current().query.deadline_ms, 99_999);
    }

    #[test]
    fn invalid_reload_does_not_replace_current_snapshot() {
        let reloader = ProfileReloader::new(RuntimeProfile::default());
        let mut bad = RuntimeProfile::default();
        bad.query.deadline_ms = 100;
        bad.step.default_timeout_ms = 5_000;
        let err = reloader.reload(bad, &HashSet::new(), &HashSet::new()).unwrap_err();
        assert!(matches!(err, ProfileError::TimeoutHierarchy(_)));
        assert_eq!(reloader.current().query.deadline_ms, 30_000);
    }
}
