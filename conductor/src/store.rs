//! Conversation Store: durable conversations, messages, per-query analysis
//! records, and message feedback (spec §4.H). `InMemoryStore` is the
//! DashMap-backed reference used by tests; `SqliteStore` is the persisted
//! backend, grounded on the teacher's own `rusqlite`-bundled usage elsewhere
//! in the corpus (cf. `memory/mod.rs`'s per-backend handle discipline).
//!
//! `record_analysis` is idempotent on `queryId` (spec §9 Open Question 3):
//! recording the same analysis twice is a no-op the second time. Reads
//! upgrade a legacy `schema_version = 0` row (`{intent, confidence}` only)
//! to the current shape on the fly, filling the fields the old schema never
//! had.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::model::{Conversation, ConversationStatus, Feedback, Message, Role};

/// Current analysis shape (schema_version = 1). A legacy `schema_version = 0`
/// row carries only `intent` and `confidence`; `domains`/`complexity`/
/// `plan_summary` read back as empty/zero defaults for those rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub query_id: String,
    pub intent: String,
    pub domains: Vec<String>,
    pub complexity: u8,
    pub plan_summary: String,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct ConversationMetrics {
    pub message_count: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Read/write contract every backend satisfies (spec §4.H).
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(&self, title: &str) -> Result<Conversation, StoreError>;
    async fn get_conversation(&self, id: &str) -> Result<Conversation, StoreError>;

    /// Atomic with respect to the conversation's `updated_at`/`message_count`
    /// bump: a reader never observes the message appended without also
    /// observing the updated counters.
    async fn append_message(&self, message: Message) -> Result<(), StoreError>;

    async fn list_messages(
        &self,
        conversation_id: &str,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, StoreError>;

    /// Idempotent on `record.query_id`: a second call with the same payload
    /// is a no-op.
    async fn record_analysis(&self, record: AnalysisRecord) -> Result<(), StoreError>;
    async fn get_analysis(&self, query_id: &str) -> Result<Option<AnalysisRecord>, StoreError>;

    async fn record_feedback(&self, feedback: Feedback) -> Result<(), StoreError>;
    async fn get_feedback_for_message(&self, message_id: &str) -> Result<Vec<Feedback>, StoreError>;

    async fn metrics(&self, conversation_id: &str) -> Result<ConversationMetrics, StoreError>;
}

/// DashMap-backed reference implementation; no persistence across process
/// restarts, used by tests and by callers that don't need durability.
#[derive(Default)]
pub struct InMemoryStore {
    conversations: DashMap<String, Conversation>,
    messages: DashMap<String, Vec<Message>>,
    analyses: DashMap<String, AnalysisRecord>,
    feedback: DashMap<String, Vec<Feedback>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn create_conversation(&self, title: &str) -> Result<Conversation, StoreError> {
        let conversation = Conversation::new(title);
        self.conversations.insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    async fn get_conversation(&self, id: &str) -> Result<Conversation, StoreError> {
        self.conversations
            .get(id)
            .map(|e| e.clone())
            .ok_or_else(|| StoreError::ConversationNotFound(id.to_string()))
    }

    async fn append_message(&self, message: Message) -> Result<(), StoreError> {
        let mut conversation = self
            .conversations
            .get_mut(&message.conversation_id)
            .ok_or_else(|| StoreError::ConversationNotFound(message.conversation_id.clone()))?;
        conversation.message_count += 1;
        conversation.updated_at = Utc::now();
        drop(conversation);

        self.messages.entry(message.conversation_id.clone()).or_default().push(message);
        Ok(())
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, StoreError> {
        let messages = self.messages.get(conversation_id).map(|e| e.clone()).unwrap_or_default();
        let mut filtered: Vec<Message> = messages
            .into_iter()
            .filter(|m| since.map(|s| m.created_at >= s).unwrap_or(true))
            .collect();
        if let Some(limit) = limit {
            filtered.truncate(limit);
        }
        Ok(filtered)
    }

    async fn record_analysis(&self, record: AnalysisRecord) -> Result<(), StoreError> {
        self.analyses.insert(record.query_id.clone(), record);
        Ok(())
    }

    async fn get_analysis(&self, query_id: &str) -> Result<Option<AnalysisRecord>, StoreError> {
        Ok(self.analyses.get(query_id).map(|e| e.clone()))
    }

    async fn record_feedback(&self, feedback: Feedback) -> Result<(), StoreError> {
        self.feedback.entry(feedback.message_id.clone()).or_default().push(feedback);
        Ok(())
    }

    async fn get_feedback_for_message(&self, message_id: &str) -> Result<Vec<Feedback>, StoreError> {
        Ok(self.feedback.get(message_id).map(|e| e.clone()).unwrap_or_default())
    }

    async fn metrics(&self, conversation_id: &str) -> Result<ConversationMetrics, StoreError> {
        let conversation = self.get_conversation(conversation_id).await?;
        Ok(ConversationMetrics {
            message_count: conversation.message_count,
            last_activity: Some(conversation.updated_at),
        })
    }
}

/// `rusqlite`-backed persisted store. A single connection guarded by a tokio
/// mutex, matching the corpus's one-handle-per-backend discipline rather
/// than a pool (spec treats persistence as out of scope for concurrency
/// tuning).
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &std::path::Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| StoreError::Backend(e.to_string()))?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Backend(e.to_string()))?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                title TEXT NOT NULL,
                status TEXT NOT NULL,
                message_count INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                meta TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS analyses (
                query_id TEXT PRIMARY KEY,
                schema_version INTEGER NOT NULL,
                intent TEXT NOT NULL,
                domains TEXT NOT NULL,
                complexity INTEGER NOT NULL,
                plan_summary TEXT NOT NULL,
                confidence REAL
            );
            CREATE TABLE IF NOT EXISTS feedback (
                id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL,
                rating INTEGER NOT NULL,
                comment TEXT,
                created_at TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn status_to_str(status: ConversationStatus) -> &'static str {
        match status {
            ConversationStatus::Active => "active",
            ConversationStatus::Archived => "archived",
        }
    }

    fn status_from_str(s: &str) -> ConversationStatus {
        match s {
            "archived" => ConversationStatus::Archived,
            _ => ConversationStatus::Active,
        }
    }

    fn role_to_str(role: Role) -> &'static str {
        match role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    fn role_from_str(s: &str) -> Role {
        match s {
            "assistant" => Role::Assistant,
            "system" => Role::System,
            _ => Role::User,
        }
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn create_conversation(&self, title: &str) -> Result<Conversation, StoreError> {
        let conversation = Conversation::new(title);
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO conversations (id, created_at, updated_at, title, status, message_count) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                conversation.id,
                conversation.created_at.to_rfc3339(),
                conversation.updated_at.to_rfc3339(),
                conversation.title,
                Self::status_to_str(conversation.status),
                conversation.message_count,
            ],
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(conversation)
    }

    async fn get_conversation(&self, id: &str) -> Result<Conversation, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, created_at, updated_at, title, status, message_count FROM conversations WHERE id = ?1",
            params![id],
            |row| {
                Ok(Conversation {
                    id: row.get(0)?,
                    created_at: parse_rfc3339(row.get::<_, String>(1)?),
                    updated_at: parse_rfc3339(row.get::<_, String>(2)?),
                    title: row.get(3)?,
                    status: Self::status_from_str(&row.get::<_, String>(4)?),
                    message_count: row.get(5)?,
                })
            },
        )
        .optional()
        .map_err(|e| StoreError::Backend(e.to_string()))?
        .ok_or_else(|| StoreError::ConversationNotFound(id.to_string()))
    }

    async fn append_message(&self, message: Message) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let meta = serde_json::to_string(&message.meta).map_err(|e| StoreError::Backend(e.to_string()))?;
        let tx = conn.unchecked_transaction().map_err(|e| StoreError::Backend(e.to_string()))?;
        tx.execute(
            "INSERT INTO messages (id, conversation_id, role, content, created_at, meta) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.id,
                message.conversation_id,
                Self::role_to_str(message.role),
                message.content,
                message.created_at.to_rfc3339(),
                meta,
            ],
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        let updated = tx
            .execute(
                "UPDATE conversations SET message_count = message_count + 1, updated_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), message.conversation_id],
            )
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        if updated == 0 {
            return Err(StoreError::ConversationNotFound(message.conversation_id));
        }
        tx.commit().map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, conversation_id, role, content, created_at, meta FROM messages
                 WHERE conversation_id = ?1 AND created_at >= ?2 ORDER BY created_at ASC",
            )
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let since_str = since.unwrap_or_else(|| DateTime::<Utc>::MIN_UTC).to_rfc3339();
        let rows = stmt
            .query_map(params![conversation_id, since_str], |row| {
                let meta_json: String = row.get(5)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    meta_json,
                ))
            })
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut messages = Vec::new();
        for row in rows {
            let (id, conversation_id, role, content, created_at, meta_json) = row.map_err(|e| StoreError::Backend(e.to_string()))?;
            let meta = serde_json::from_str(&meta_json).map_err(|e| StoreError::Backend(e.to_string()))?;
            messages.push(Message {
                id,
                conversation_id,
                role: Self::role_from_str(&role),
                content,
                created_at: parse_rfc3339(created_at),
                meta,
            });
            if let Some(limit) = limit {
                if messages.len() >= limit {
                    break;
                }
            }
        }
        Ok(messages)
    }

    async fn record_analysis(&self, record: AnalysisRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let existing: Option<String> = conn
            .query_row(
                "SELECT intent || '|' || domains || '|' || complexity || '|' || plan_summary || '|' || IFNULL(confidence, '')
                 FROM analyses WHERE query_id = ?1",
                params![record.query_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let domains_json = serde_json::to_string(&record.domains).map_err(|e| StoreError::Backend(e.to_string()))?;
        let fingerprint = format!(
            "{}|{}|{}|{}|{}",
            record.intent,
            domains_json,
            record.complexity,
            record.plan_summary,
            record.confidence.map(|c| c.to_string()).unwrap_or_default()
        );
        if existing.as_deref() == Some(fingerprint.as_str()) {
            return Ok(()); // idempotent no-op: identical payload already recorded
        }

        conn.execute(
            "INSERT INTO analyses (query_id, schema_version, intent, domains, complexity, plan_summary, confidence)
             VALUES (?1, 1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(query_id) DO UPDATE SET
                schema_version = 1, intent = excluded.intent, domains = excluded.domains,
                complexity = excluded.complexity, plan_summary = excluded.plan_summary, confidence = excluded.confidence",
            params![record.query_id, record.intent, domains_json, record.complexity, record.plan_summary, record.confidence],
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get_analysis(&self, query_id: &str) -> Result<Option<AnalysisRecord>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT schema_version, intent, domains, complexity, plan_summary, confidence FROM analyses WHERE query_id = ?1",
            params![query_id],
            |row| {
                let schema_version: i64 = row.get(0)?;
                let intent: String = row.get(1)?;
                let confidence: Option<f64> = row.get(5)?;
                if schema_version == 0 {
                    // Legacy shape: only intent + confidence were ever recorded.
                    return Ok(AnalysisRecord {
                        query_id: query_id.to_string(),
                        intent,
                        domains: Vec::new(),
                        complexity: 0,
                        plan_summary: String::new(),
                        confidence,
                    });
                }
                let domains_json: String = row.get(2)?;
                let domains: Vec<String> = serde_json::from_str(&domains_json).unwrap_or_default();
                Ok(AnalysisRecord {
                    query_id: query_id.to_string(),
                    intent,
                    domains,
                    complexity: row.get::<_, i64>(3)? as u8,
                    plan_summary: row.get(4)?,
                    confidence,
                })
            },
        )
        .optional()
        .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn record_feedback(&self, feedback: Feedback) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO feedback (id, message_id, rating, comment, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![feedback.id, feedback.message_id, feedback.rating, feedback.comment, feedback.created_at.to_rfc3339()],
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get_feedback_for_message(&self, message_id: &str) -> Result<Vec<Feedback>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT id, message_id, rating, comment, created_at FROM feedback WHERE message_id = ?1 ORDER BY created_at ASC")
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let rows = stmt
            .query_map(params![message_id], |row| {
                Ok(Feedback {
                    id: row.get(0)?,
                    message_id: row.get(1)?,
                    rating: row.get(2)?,
                    comment: row.get(3)?,
                    created_at: parse_rfc3339(row.get::<_, String>(4)?),
                })
            })
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn metrics(&self, conversation_id: &str) -> Result<ConversationMetrics, StoreError> {
        let conversation = self.get_conversation(conversation_id).await?;
        Ok(ConversationMetrics {
            message_count: conversation.message_count,
            last_activity: Some(conversation.updated_at),
        })
    }
}

fn parse_rfc3339(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s).map(|dt| dt.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;

    async fn exercise_round_trip(store: &dyn ConversationStore) {
        let conversation = store.create_conversation("test convo").await.unwrap();
        for i in 0..3 {
            let message = Message::new(conversation.id.clone(), Role::User, format!("message {i}"));
            store.append_message(message).await.unwrap();
        }
        let messages = store.list_messages(&conversation.id, None, None).await.unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].content, "message 0");
        assert_eq!(messages[2].content, "message 2");

        let metrics = store.metrics(&conversation.id).await.unwrap();
        assert_eq!(metrics.message_count, 3);
    }

    /// **Scenario (spec §8)**: appending N messages then listing yields the
    /// same N in insertion order.
    #[tokio::test]
    async fn in_memory_store_round_trips_messages() {
        exercise_round_trip(&InMemoryStore::new()).await;
    }

    #[tokio::test]
    async fn sqlite_store_round_trips_messages() {
        exercise_round_trip(&SqliteStore::open_in_memory().unwrap()).await;
    }

    async fn exercise_idempotent_analysis(store: &dyn ConversationStore) {
        let record = AnalysisRecord {
            query_id: "q1".to_string(),
            intent: "research".to_string(),
            domains: vec!["science".to_string()],
            complexity: 3,
            plan_summary: "fetch and summarize".to_string(),
            confidence: Some(0.8),
        };
        store.record_analysis(record.clone()).await.unwrap();
        store.record_analysis(record.clone()).await.unwrap(); // same payload: no-op

        let fetched = store.get_analysis("q1").await.unwrap().unwrap();
        assert_eq!(fetched.intent, "research");
        assert_eq!(fetched.domains, vec!["science".to_string()]);
    }

    /// **Scenario (spec §9 Open Question 3)**: recording the same analysis
    /// payload twice for one `query_id` is idempotent.
    #[tokio::test]
    async fn in_memory_record_analysis_is_idempotent() {
        exercise_idempotent_analysis(&InMemoryStore::new()).await;
    }

    #[tokio::test]
    async fn sqlite_record_analysis_is_idempotent() {
        exercise_idempotent_analysis(&SqliteStore::open_in_memory().unwrap()).await;
    }

    /// **Scenario**: a legacy `schema_version = 0` row upgrades to the
    /// current shape on read, with the fields it never had defaulting empty.
    #[tokio::test]
    async fn sqlite_upgrades_legacy_analysis_schema_on_read() {
        let store = SqliteStore::open_in_memory().unwrap();
        {
            let conn = store.conn.lock().await;
            conn.execute(
                "INSERT INTO analyses (query_id, schema_version, intent, domains, complexity, plan_summary, confidence)
                 VALUES ('legacy-q', 0, 'legacy-intent', '', 0, '', 0.6)",
                [],
            )
            .unwrap();
        }
        let record = store.get_analysis("legacy-q").await.unwrap().unwrap();
        assert_eq!(record.intent, "legacy-intent");
        assert!(record.domains.is_empty());
        assert_eq!(record.complexity, 0);
        assert_eq!(record.confidence, Some(0.6));
    }

    #[tokio::test]
    async fn feedback_is_append_only_and_listed_in_order() {
        let store = InMemoryStore::new();
        let conversation = store.create_conversation("c").await.unwrap();
        let message = Message::new(conversation.id.clone(), Role::Assistant, "answer");
        store.append_message(message.clone()).await.unwrap();

        store
            .record_feedback(Feedback { id: "f1".into(), message_id: message.id.clone(), rating: 1, comment: None, created_at: Utc::now() })
            .await
            .unwrap();
        store
            .record_feedback(Feedback { id: "f2".into(), message_id: message.id.clone(), rating: -1, comment: Some("nope".into()), created_at: Utc::now() })
            .await
            .unwrap();

        let feedback = store.get_feedback_for_message(&message.id).await.unwrap();
        assert_eq!(feedback.len(), 2);
        assert_eq!(feedback[0].id, "f1");
        assert_eq!(feedback[1].id, "f2");
    }

    #[tokio::test]
    async fn get_conversation_missing_is_not_found_error() {
        let store = InMemoryStore::new();
        let err = store.get_conversation("ghost").await.unwrap_err();
        assert!(matches!(err, StoreError::ConversationNotFound(_)));
    }
}
