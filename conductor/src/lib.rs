//! # Conductor
//!
//! The core of a multi-agent orchestration runtime: a four-stage pipeline
//! (analyze → route → plan → execute) that turns a user query into a
//! confidence-scored, streamed response, dispatching steps to leased
//! specialist agents and named tools under a hard end-to-end deadline.
//!
//! ## Design principles
//!
//! - **Interface-typed collaborators**: every component (model provider,
//!   retrieval, agent pool, tool registry, conversation store, streaming
//!   fabric) is a trait; the [`Orchestrator`] holds `Arc<dyn Trait>` handles
//!   threaded in at construction rather than reaching for a global.
//! - **Never-empty terminal events**: a successful query always carries
//!   non-empty content; execution failures become a fallback message, not a
//!   silent empty success (spec §7).
//! - **Explicit cancellation and deadlines**: every suspension point accepts
//!   a [`tokio_util::sync::CancellationToken`] derived from the query's
//!   context, and step/tool timeouts are validated against the remaining
//!   query deadline rather than hardcoded.
//! - **Kind-level error taxonomy**: [`error::ConductorError`] classifies
//!   failures the way the spec does (`invalid_input`, `timeout`,
//!   `pool_exhausted`, `degraded`, ...), with per-component `thiserror` enums
//!   composed upward via `#[from]`.
//!
//! ## Main modules
//!
//! - [`model`]: the shared data model — [`model::Conversation`],
//!   [`model::Message`], [`model::Query`], [`model::Plan`], [`model::Step`],
//!   [`model::StepResult`], [`model::AgentDescriptor`],
//!   [`model::ToolDescriptor`], [`model::RetrievalItem`],
//!   [`model::ConfidenceRecord`], [`model::Feedback`],
//!   [`model::SubscriberChannel`].
//! - [`provider`]: [`provider::ModelProviderClient`] trait (generate,
//!   streamed generate, log-prob generate, embed) plus
//!   [`provider::MockProviderClient`] and [`provider::OpenAiProviderClient`];
//!   [`provider::retry`] for backoff on transient/rate-limited errors.
//! - [`retrieval`]: [`retrieval::RetrievalEngine`] — hybrid semantic +
//!   lexical search fused by Reciprocal Rank Fusion, optional rerank,
//!   `degraded` on partial backend failure.
//! - [`confidence`]: raw-score extraction (log-probs or surface features),
//!   multi-modal quality evaluation, isotonic calibration
//!   ([`confidence::IsotonicCalibration`]), uncertainty bucketing, and
//!   adaptive delivery policy.
//! - [`tools`]: [`tools::Tool`] trait and [`tools::ToolRegistry`] —
//!   register/describe/invoke with schema validation, timeout, and fallback.
//! - [`pool`]: [`pool::Agent`] trait and [`pool::AgentPool`] — bounded,
//!   leasing, warm-pool worker registry with health checks and retirement.
//! - [`plan`]: plan validation (DAG, unique ids, resolvable dependencies) and
//!   [`plan::PlanExecutor`] — dependency-ordered scheduling with per-step
//!   timeout, retry, and cancellation.
//! - [`orchestrator`]: [`orchestrator::Orchestrator`] — the four-stage
//!   pipeline tying every other component together behind `handle`.
//! - [`store`]: [`store::ConversationStore`] trait plus
//!   [`store::InMemoryStore`] and [`store::SqliteStore`] — conversations,
//!   messages, analyses (dual-read), feedback, metrics.
//! - [`streaming`]: [`streaming::StreamingFabric`] — a per-query topic with a
//!   monotonic sequence number, bounded replay window, coalesced
//!   `step_progress`, and an explicit `Cancel` distinct from a subscriber
//!   dropping its receiver.
//! - [`cache`]: [`cache::Cache`] trait, an LRU+TTL implementation, and
//!   [`cache::CacheLayers`] — the four named layers (L1 exact, L2 semantic,
//!   retrieval, embedding).
//! - [`error`]: [`error::ConductorError`] and the per-component error enums.
//!
//! Feature flags and live-reloadable configuration (timeout-hierarchy and
//! unknown-agent/tool validation) live in the sibling `config` crate,
//! consumed here as `env_config` (re-exported dependency alias); see
//! [`orchestrator::Orchestrator::new`]'s `profile: watch::Receiver<Arc<env_config::RuntimeProfile>>`
//! parameter for how live reload reaches a running orchestrator.

pub mod cache;
pub mod confidence;
pub mod error;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod plan;
pub mod pool;
pub mod provider;
pub mod retrieval;
pub mod store;
pub mod streaming;
pub mod tools;

pub use cache::{Cache, CacheError, CacheLayers, LruTtlCache};
pub use confidence::{
    DeliveryDecision, DeliveryProfile, IsotonicCalibration, RawScoreWeights,
};
pub use error::{
    ConductorError, ConfidenceError, ConfigError, PlanError, PoolError, ProviderError,
    RetrievalError, StoreError, StreamError, ToolError,
};
pub use model::{
    AgentDescriptor, ConfidenceBucket, ConfidenceRecord, Conversation, ConversationStatus,
    Feedback, Message, MessageMeta, Plan, PlanStrategy, QualityScores, Query, Rating, Role,
    SideEffects, Step, StepResult, StepStatus, SubscriberChannel, ToolDescriptor,
    UncertaintyLevel,
};
pub use orchestrator::{AnalysisResult, Orchestrator};
pub use plan::PlanExecutor;
pub use pool::{Agent, AgentFactory, AgentPool, Lease};
pub use provider::{
    ChunkStream, FinishReason, GenerateChunk, GenerateParams, GenerateResult,
    GenerateWithLogProbsResult, MockProviderClient, ModelProviderClient, OpenAiProviderClient,
    TokenLogProb,
};
pub use retrieval::{
    LexicalBackend, RankedCandidate, Reranker, RetrievalEngine, RetrievalFilters, RetrievalResult,
    SemanticBackend,
};
pub use store::{AnalysisRecord, ConversationMetrics, ConversationStore, InMemoryStore, SqliteStore};
pub use streaming::{ConductorEvent, Envelope, StreamingFabric, Subscription};
pub use tools::{EchoTool, HttpFetchTool, SlowTool, Tool, ToolCallContext, ToolRegistry};

/// Re-exported so downstream binaries can name the config crate as
/// `conductor::config` without adding a second `Cargo.toml` dependency entry.
pub use env_config as config;
