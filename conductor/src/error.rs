//! Outward error taxonomy. `ConductorError` is the kind-level classification
//! every component error ultimately maps into (spec error taxonomy, not a
//! type hierarchy): `invalid_input`, `invalid_plan`, `timeout`, `cancelled`,
//! `provider_error`, `upstream_error`, `pool_exhausted`, `degraded`,
//! `internal`. Per-component enums carry the detail; `#[from]` composes them
//! upward.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConductorError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid plan: {0}")]
    InvalidPlan(#[from] PlanError),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("agent pool exhausted: {0}")]
    PoolExhausted(#[from] PoolError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("retrieval degraded: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("confidence error: {0}")]
    Confidence(#[from] ConfidenceError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ConductorError {
    /// Whether the kind carries a `degraded` advisory flag rather than a hard failure.
    pub fn is_degraded(&self) -> bool {
        matches!(self, ConductorError::Retrieval(RetrievalError::Degraded { .. }))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConductorError::Timeout(_)
                | ConductorError::Provider(ProviderError::Transient(_))
                | ConductorError::Provider(ProviderError::RateLimited { .. })
        )
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transient provider failure: {0}")]
    Transient(String),
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("provider rejected request: {0}")]
    Rejected(String),
    #[error("provider timed out")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("both retrieval backends unavailable")]
    BothBackendsDown,
    #[error("retrieval degraded: {reason}")]
    Degraded { reason: String },
}

#[derive(Debug, Error)]
pub enum ConfidenceError {
    #[error("calibration model not fitted")]
    Uncalibrated,
    #[error("invalid quality score: {0}")]
    InvalidScore(String),
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    NotFound(String),
    #[error("schema validation failed for {tool}: {reason}")]
    SchemaInvalid { tool: String, reason: String },
    #[error("tool {0} timed out")]
    Timeout(String),
    #[error("tool {tool} failed: {reason}")]
    Failed { tool: String, reason: String },
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent {agent} does not support {stage}")]
    Unsupported { agent: String, stage: String },
    #[error("agent {agent} failed: {reason}")]
    Failed { agent: String, reason: String },
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
    #[error("lease wait timed out for agent {0}")]
    LeaseTimeout(String),
    #[error("agent pool shutting down")]
    ShuttingDown,
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("duplicate step id: {0}")]
    DuplicateStepId(String),
    #[error("step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: String, dependency: String },
    #[error("cycle detected in plan graph, involving step {0}")]
    CycleDetected(String),
    #[error("plan has no steps")]
    Empty,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("message not found: {0}")]
    MessageNotFound(String),
    #[error("backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("unknown query topic: {0}")]
    UnknownQuery(String),
    #[error("subscriber cursor {cursor} precedes replay window start {window_start}")]
    CursorTooOld { cursor: u64, window_start: u64 },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config violates timeout hierarchy: {0}")]
    TimeoutHierarchy(String),
    #[error("config references unknown agent: {0}")]
    UnknownAgent(String),
    #[error("config references unknown tool: {0}")]
    UnknownTool(String),
    #[error("load error: {0}")]
    Load(String),
}

impl From<env_config::ProfileError> for ConfigError {
    fn from(err: env_config::ProfileError) -> Self {
        match err {
            env_config::ProfileError::TimeoutHierarchy(reason) => ConfigError::TimeoutHierarchy(reason),
            env_config::ProfileError::UnknownAgent(name) => ConfigError::UnknownAgent(name),
            env_config::ProfileError::UnknownTool(name) => ConfigError::UnknownTool(name),
            other => ConfigError::Load(other.to_string()),
        }
    }
}
