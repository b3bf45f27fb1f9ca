//! Streaming Fabric: one topic per `queryId`, fanning events out to any number
//! of subscribers with a monotonically increasing sequence number and a
//! bounded replay window so a subscriber that attaches late (or reconnects)
//! can catch up instead of losing events.
//!
//! Wire shape and sequencing follow the same envelope discipline as the
//! `stream-event` crate's `Envelope`/`EnvelopeState` (there: one sequence
//! counter per run, injected into every event); here the counter is one per
//! query topic and every subscriber reads the same sequence, tracking its own
//! cursor into it rather than keeping a private counter.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};

use crate::error::StreamError;
use crate::model::{ConfidenceBucket, PlanStrategy, QualityScores, StepStatus};

/// Summary of a just-built plan, carried on the `started` event so a
/// subscriber sees the shape of the work before any step reports progress.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanSummary {
    pub strategy: PlanStrategy,
    pub steps: Vec<PlanStepSummary>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanStepSummary {
    pub id: String,
    pub agent: String,
    pub tool_name: Option<String>,
}

/// Confidence payload carried on the terminal `final_content` event, mirroring
/// `ConfidenceRecord` without the internal `token_log_probs`/id bookkeeping a
/// subscriber has no use for.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FinalConfidence {
    pub calibrated: f64,
    pub bucket: ConfidenceBucket,
    pub quality: QualityScores,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceSnippet {
    pub doc_id: String,
    pub chunk_id: String,
    pub snippet: String,
}

/// Wire event for one query's stream. `step_progress` is the only droppable,
/// coalescible variant; every other variant is delivered to every subscriber
/// at least once, including under backpressure.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConductorEvent {
    Started { plan: PlanSummary },
    StageEnter { stage: String },
    StageExit { stage: String, ok: bool },
    StepStart {
        step_id: String,
        agent: String,
        tool_name: Option<String>,
    },
    StepProgress {
        step_id: String,
        percent: u8,
        message: String,
    },
    StepEnd {
        step_id: String,
        status: StepStatus,
        ms: u64,
        tokens_in: u64,
        tokens_out: u64,
    },
    Token { content: String },
    Retrieval { item_count: usize, degraded: bool },
    Final {
        message_id: String,
        content: String,
        confidence: FinalConfidence,
        sources: Vec<SourceSnippet>,
    },
    Metrics {
        total_ms: u64,
        tokens_in: u64,
        tokens_out: u64,
        tool_calls: usize,
    },
    Error { kind: String, message: String },
    Cancelled,
}

impl ConductorEvent {
    /// `step_progress` is coalescible and may be dropped under backpressure;
    /// every other event is a step boundary or terminal event and must never
    /// be dropped (spec invariant: only progress updates are droppable).
    pub fn is_droppable(&self) -> bool {
        matches!(self, ConductorEvent::StepProgress { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConductorEvent::Final { .. } | ConductorEvent::Error { .. } | ConductorEvent::Cancelled
        )
    }

    fn progress_key(&self) -> Option<&str> {
        match self {
            ConductorEvent::StepProgress { step_id, .. } => Some(step_id.as_str()),
            _ => None,
        }
    }
}

/// One envelope on the wire: the event plus its position in the topic's
/// sequence.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub query_id: String,
    pub seq: u64,
    pub event: ConductorEvent,
}

struct Topic {
    sender: broadcast::Sender<Envelope>,
    replay: Mutex<VecDeque<(Envelope, Instant)>>,
    next_seq: AtomicU64,
    cancelled: std::sync::atomic::AtomicBool,
}

impl Topic {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            replay: Mutex::new(VecDeque::new()),
            next_seq: AtomicU64::new(0),
            cancelled: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

/// A live subscription: an already-materialized catch-up batch followed by a
/// live receiver for everything published after the batch was taken.
pub struct Subscription {
    pub catch_up: Vec<Envelope>,
    pub receiver: broadcast::Receiver<Envelope>,
}

/// Per-query publish/subscribe bus. One instance is shared across the whole
/// orchestrator; topics are created lazily on first publish/subscribe and
/// reaped after their terminal event plus a grace period.
pub struct StreamingFabric {
    topics: DashMap<String, Arc<Topic>>,
    channel_capacity: usize,
    replay_events: usize,
    replay_window: Duration,
}

impl StreamingFabric {
    pub fn new(channel_capacity: usize, replay_events: usize, replay_window: Duration) -> Self {
        Self {
            topics: DashMap::new(),
            channel_capacity,
            replay_events,
            replay_window,
        }
    }

    fn topic(&self, query_id: &str) -> Arc<Topic> {
        self.topics
            .entry(query_id.to_string())
            .or_insert_with(|| Arc::new(Topic::new(self.channel_capacity)))
            .clone()
    }

    /// Publishes an event to a query's topic, assigning it the next sequence
    /// number. `step_progress` events coalesce: a fresh progress update for
    /// the same `step_id` replaces the most recent buffered one instead of
    /// growing the replay window, but every publish still goes out live so a
    /// connected subscriber sees every update, dropped ones included only
    /// under receiver lag (a `broadcast` property, not something this code
    /// induces).
    pub async fn publish(&self, query_id: &str, event: ConductorEvent) -> u64 {
        let topic = self.topic(query_id);
        let seq = topic.next_seq.fetch_add(1, Ordering::SeqCst);
        let envelope = Envelope {
            query_id: query_id.to_string(),
            seq,
            event,
        };

        let _ = topic.sender.send(envelope.clone());

        let mut replay = topic.replay.lock().await;
        if let Some(key) = envelope.event.progress_key() {
            if let Some(last) = replay.back_mut() {
                if last.0.event.progress_key() == Some(key) {
                    *last = (envelope.clone(), Instant::now());
                    self.trim_locked(&mut replay);
                    return seq;
                }
            }
        }
        replay.push_back((envelope, Instant::now()));
        self.trim_locked(&mut replay);
        seq
    }

    fn trim_locked(&self, replay: &mut VecDeque<(Envelope, Instant)>) {
        while replay.len() > self.replay_events {
            replay.pop_front();
        }
        let cutoff = Instant::now().checked_sub(self.replay_window);
        if let Some(cutoff) = cutoff {
            while replay
                .front()
                .map(|(_, seen)| *seen < cutoff)
                .unwrap_or(false)
            {
                replay.pop_front();
            }
        }
    }

    /// Subscribes to a query's topic. `from_seq` replays buffered events with
    /// `seq >= from_seq`; `None` replays the whole current buffer (a fresh
    /// subscriber joining mid-query still sees every still-buffered event).
    pub async fn subscribe(
        &self,
        query_id: &str,
        from_seq: Option<u64>,
    ) -> Result<Subscription, StreamError> {
        let topic = self.topic(query_id);
        let receiver = topic.sender.subscribe();
        let replay = topic.replay.lock().await;
        let window_start = replay.front().map(|(e, _)| e.seq).unwrap_or(0);
        if let Some(cursor) = from_seq {
            if cursor < window_start && !replay.is_empty() {
                return Err(StreamError::CursorTooOld {
                    cursor,
                    window_start,
                });
            }
        }
        let catch_up = replay
            .iter()
            .filter(|(e, _)| from_seq.map(|c| e.seq >= c).unwrap_or(true))
            .map(|(e, _)| e.clone())
            .collect();
        Ok(Subscription { catch_up, receiver })
    }

    /// Explicit cancel: distinct from a subscriber disconnecting. Publishes a
    /// `Cancelled` terminal event to every current subscriber.
    pub async fn cancel(&self, query_id: &str) {
        if let Some(topic) = self.topics.get(query_id) {
            topic.cancelled.store(true, Ordering::SeqCst);
        }
        self.publish(query_id, ConductorEvent::Cancelled).await;
    }

    pub fn is_cancelled(&self, query_id: &str) -> bool {
        self.topics
            .get(query_id)
            .map(|t| t.cancelled.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Drops a topic's state. Callers invoke this some grace period after a
    /// terminal event so late subscribers still get one replay pass first.
    pub fn close(&self, query_id: &str) {
        self.topics.remove(query_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: sequence numbers are assigned in publish order and are
    /// visible to a subscriber that joined before any publish.
    #[tokio::test]
    async fn sequence_numbers_increase_monotonically() {
        let fabric = StreamingFabric::new(64, 100, Duration::from_secs(60));
        let sub = fabric.subscribe("q1", None).await.unwrap();
        let mut rx = sub.receiver;

        fabric
            .publish(
                "q1",
                ConductorEvent::StepStart {
                    step_id: "s1".into(),
                    agent: "research".into(),
                    tool_name: None,
                },
            )
            .await;
        fabric
            .publish(
                "q1",
                ConductorEvent::StepEnd {
                    step_id: "s1".into(),
                    status: StepStatus::Ok,
                    ms: 12,
                    tokens_in: 0,
                    tokens_out: 0,
                },
            )
            .await;

        let e1 = rx.recv().await.unwrap();
        let e2 = rx.recv().await.unwrap();
        assert_eq!(e1.seq, 0);
        assert_eq!(e2.seq, 1);
    }

    /// **Scenario**: a late subscriber replays buffered events from the
    /// requested cursor instead of missing everything published before it
    /// attached.
    #[tokio::test]
    async fn late_subscriber_replays_from_cursor() {
        let fabric = StreamingFabric::new(64, 100, Duration::from_secs(60));
        fabric
            .publish(
                "q1",
                ConductorEvent::StepStart {
                    step_id: "s1".into(),
                    agent: "research".into(),
                    tool_name: None,
                },
            )
            .await;
        fabric
            .publish(
                "q1",
                ConductorEvent::StepEnd {
                    step_id: "s1".into(),
                    status: StepStatus::Ok,
                    ms: 12,
                    tokens_in: 0,
                    tokens_out: 0,
                },
            )
            .await;

        let sub = fabric.subscribe("q1", Some(1)).await.unwrap();
        assert_eq!(sub.catch_up.len(), 1);
        assert_eq!(sub.catch_up[0].seq, 1);
    }

    /// **Scenario**: consecutive `step_progress` events for the same step
    /// coalesce in the replay buffer rather than accumulating unboundedly.
    #[tokio::test]
    async fn progress_events_coalesce_in_replay_buffer() {
        let fabric = StreamingFabric::new(64, 100, Duration::from_secs(60));
        for pct in [10, 40, 90] {
            fabric
                .publish(
                    "q1",
                    ConductorEvent::StepProgress {
                        step_id: "s1".into(),
                        percent: pct,
                        message: "working".into(),
                    },
                )
                .await;
        }
        let sub = fabric.subscribe("q1", None).await.unwrap();
        assert_eq!(sub.catch_up.len(), 1);
        match &sub.catch_up[0].event {
            ConductorEvent::StepProgress { percent, .. } => assert_eq!(*percent, 90),
            _ => panic!("expected step_progress"),
        }
    }

    /// **Scenario**: requesting a cursor older than the replay window start
    /// is rejected rather than silently truncated.
    #[tokio::test]
    async fn cursor_older_than_window_is_rejected() {
        let fabric = StreamingFabric::new(64, 2, Duration::from_secs(60));
        for i in 0..5 {
            fabric
                .publish(
                    "q1",
                    ConductorEvent::StepStart {
                        step_id: format!("s{i}"),
                        agent: "research".into(),
                        tool_name: None,
                    },
                )
                .await;
        }
        let err = fabric.subscribe("q1", Some(0)).await.unwrap_err();
        assert!(matches!(err, StreamError::CursorTooOld { .. }));
    }

    /// **Scenario**: cancel publishes a terminal `Cancelled` event distinct
    /// from a subscriber disconnecting.
    #[tokio::test]
    async fn cancel_publishes_terminal_event() {
        let fabric = StreamingFabric::new(64, 100, Duration::from_secs(60));
        let sub = fabric.subscribe("q1", None).await.unwrap();
        let mut rx = sub.receiver;
        fabric.cancel("q1").await;
        let envelope = rx.recv().await.unwrap();
        assert!(matches!(envelope.event, ConductorEvent::Cancelled));
        assert!(fabric.is_cancelled("q1"));
    }
}
