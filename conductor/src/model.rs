//! Core data model shared across every component: conversations, messages,
//! queries, plans, steps, agent/tool descriptors, retrieval items, confidence
//! records, feedback, and subscriber channels.
//!
//! Plain `serde`-derived types with no component-specific behavior; components
//! read and write these directly rather than each inventing their own shapes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Generates a fresh opaque id (queryId, stepId, subscriberId, ...).
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub title: String,
    pub status: ConversationStatus,
    pub message_count: u64,
}

impl Conversation {
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            created_at: now,
            updated_at: now,
            title: title.into(),
            status: ConversationStatus::Active,
            message_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Confidence fields live on `meta`; populated for `role=assistant`, absent
/// otherwise (data model invariant 1).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageMeta {
    pub query_id: Option<String>,
    pub model_used: Option<String>,
    pub confidence: Option<ConfidenceRecord>,
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub meta: MessageMeta,
}

impl Message {
    pub fn new(conversation_id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            conversation_id: conversation_id.into(),
            role,
            content: content.into(),
            created_at: Utc::now(),
            meta: MessageMeta::default(),
        }
    }
}

/// Transient per-turn coordination record. Created at orchestrator entry,
/// destroyed after terminal event emission; owned exclusively by the
/// Orchestrator for the duration of execution.
#[derive(Clone)]
pub struct Query {
    pub query_id: String,
    pub conversation_id: Option<String>,
    pub user_text: String,
    pub received_at: DateTime<Utc>,
    pub deadline_at: DateTime<Utc>,
    pub complexity: Option<u8>,
    pub intent: Option<String>,
    pub domains: Vec<String>,
    pub priority: u8,
    pub cancel: CancellationToken,
}

impl Query {
    pub fn new(user_text: impl Into<String>, deadline_ms: i64) -> Self {
        let received_at = Utc::now();
        Self {
            query_id: new_id(),
            conversation_id: None,
            user_text: user_text.into(),
            received_at,
            deadline_at: received_at + chrono::Duration::milliseconds(deadline_ms),
            complexity: None,
            intent: None,
            domains: Vec::new(),
            priority: 0,
            cancel: CancellationToken::new(),
        }
    }

    /// Remaining time until the query's hard deadline; zero (not negative) once expired.
    pub fn remaining(&self) -> std::time::Duration {
        let ms = (self.deadline_at - Utc::now()).num_milliseconds();
        std::time::Duration::from_millis(ms.max(0) as u64)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.remaining().is_zero()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStrategy {
    Sequential,
    Parallel,
    Graph,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub step_id: String,
    pub agent: String,
    pub tool_name: Option<String>,
    pub inputs: serde_json::Value,
    pub depends_on: Vec<String>,
    pub timeout_ms: u64,
    pub retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    pub query_id: String,
    pub steps: Vec<Step>,
    pub strategy: PlanStrategy,
}

impl Plan {
    pub fn new(query_id: impl Into<String>, steps: Vec<Step>, strategy: PlanStrategy) -> Self {
        Self {
            plan_id: new_id(),
            query_id: query_id.into(),
            steps,
            strategy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Failed,
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    pub output: serde_json::Value,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub tool_calls: Vec<ToolCallRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub name: String,
    pub capabilities: HashMap<String, serde_json::Value>,
    pub tools: Vec<String>,
    pub model_preference: Option<String>,
    pub warmup: bool,
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffects {
    None,
    Read,
    Write,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameter_schema: serde_json::Value,
    pub timeout_ms: u64,
    pub fallback: Option<String>,
    pub idempotent: bool,
    pub side_effects: SideEffects,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalItem {
    pub doc_id: String,
    pub chunk_id: String,
    pub text: String,
    pub source: String,
    pub score_semantic: Option<f64>,
    pub score_lexical: Option<f64>,
    pub score_fused: f64,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UncertaintyLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBucket {
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QualityScores {
    pub factuality: f64,
    pub relevance: f64,
    pub coherence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceRecord {
    pub query_id: String,
    pub response_id: String,
    pub token_log_probs: Option<Vec<f64>>,
    pub raw_score: f64,
    pub calibrated_score: f64,
    pub quality_scores: QualityScores,
    pub uncertainty_level: UncertaintyLevel,
    pub bucket: ConfidenceBucket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rating {
    Down = -1,
    Neutral = 0,
    Up = 1,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    pub id: String,
    pub message_id: String,
    pub rating: i8,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Lifetime bounded by a query's terminal event or explicit unsubscribe.
#[derive(Debug, Clone)]
pub struct SubscriberChannel {
    pub query_id: String,
    pub subscriber_id: String,
    pub cursor: u64,
}

/// Classification produced by the analyze stage. Shared between the
/// Orchestrator (which produces the first pass via the Model Provider or the
/// rule-based fallback) and `Agent::handle_analyze` (which a leased agent may
/// use to refine it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub intent: String,
    pub domains: Vec<String>,
    pub complexity: u8,
}

/// An agent's own opinion on routing: itself, plus an ordered list of
/// fallbacks it would defer to if it can't serve the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDecision {
    pub agent: String,
    pub fallbacks: Vec<String>,
}
