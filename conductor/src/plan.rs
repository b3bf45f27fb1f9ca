//! Plan Executor: validates a [`Plan`]'s DAG, schedules its steps in
//! topological ready-sets, and runs each one against the Agent Pool and Tool
//! Registry under a deadline that never exceeds the query's remaining time
//! (spec §4.F). No teacher file runs a DAG of typed steps directly; the
//! wave-by-wave ready-set scheduling follows the same `join_all`-per-stage
//! discipline the corpus uses for fan-out (cf. `graph/` in the teacher),
//! generalized from a fixed pipeline to an arbitrary step graph.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::error::PlanError;
use crate::model::{Plan, Query, Step, StepResult, StepStatus, ToolCallRecord};
use crate::pool::AgentPool;
use crate::streaming::{ConductorEvent, StreamingFabric};
use crate::tools::{ToolCallContext, ToolRegistry};

/// Checks step-id uniqueness, dependency existence, and acyclicity (spec §8
/// property 1, half one: a plan that fails any of these is rejected before
/// any step runs).
pub fn validate(plan: &Plan) -> Result<(), PlanError> {
    if plan.steps.is_empty() {
        return Err(PlanError::Empty);
    }

    let mut seen = HashSet::new();
    for step in &plan.steps {
        if !seen.insert(step.step_id.as_str()) {
            return Err(PlanError::DuplicateStepId(step.step_id.clone()));
        }
    }
    for step in &plan.steps {
        for dep in &step.depends_on {
            if !seen.contains(dep.as_str()) {
                return Err(PlanError::UnknownDependency { step: step.step_id.clone(), dependency: dep.clone() });
            }
        }
    }
    detect_cycle(plan)
}

fn detect_cycle(plan: &Plan) -> Result<(), PlanError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let by_id: HashMap<&str, &Step> = plan.steps.iter().map(|s| (s.step_id.as_str(), s)).collect();
    let mut marks: HashMap<&str, Mark> = plan.steps.iter().map(|s| (s.step_id.as_str(), Mark::Unvisited)).collect();

    fn visit<'a>(
        id: &'a str,
        by_id: &HashMap<&'a str, &'a Step>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Result<(), PlanError> {
        match marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::InProgress) => return Err(PlanError::CycleDetected(id.to_string())),
            _ => {}
        }
        marks.insert(id, Mark::InProgress);
        if let Some(step) = by_id.get(id) {
            for dep in &step.depends_on {
                visit(dep.as_str(), by_id, marks)?;
            }
        }
        marks.insert(id, Mark::Done);
        Ok(())
    }

    for step in &plan.steps {
        visit(step.step_id.as_str(), &by_id, &mut marks)?;
    }
    Ok(())
}

/// Runs a validated plan's steps against the Agent Pool and Tool Registry,
/// streaming lifecycle events as it goes.
pub struct PlanExecutor {
    pool: Arc<AgentPool>,
    tools: Arc<ToolRegistry>,
    streaming: Arc<StreamingFabric>,
}

impl PlanExecutor {
    pub fn new(pool: Arc<AgentPool>, tools: Arc<ToolRegistry>, streaming: Arc<StreamingFabric>) -> Self {
        Self { pool, tools, streaming }
    }

    /// Runs every step to completion, cancellation, or its retry-exhausted
    /// timeout, in topological waves. Each wave runs its ready steps
    /// concurrently; a step becomes ready once every step it depends on has
    /// a result. Returns one [`StepResult`] per step that was scheduled;
    /// steps never reached because the query was cancelled first are
    /// omitted (spec §8 S4: cancellation stops scheduling, it doesn't
    /// fabricate terminal results for unstarted steps).
    pub async fn execute(&self, plan: &Plan, query: &Query) -> Result<Vec<StepResult>, PlanError> {
        validate(plan)?;

        let by_id: HashMap<String, Step> = plan.steps.iter().map(|s| (s.step_id.clone(), s.clone())).collect();
        let mut completed: HashMap<String, StepResult> = HashMap::new();
        let mut remaining: HashSet<String> = by_id.keys().cloned().collect();
        let mut results = Vec::with_capacity(plan.steps.len());

        while !remaining.is_empty() {
            if query.is_cancelled() {
                break;
            }

            let ready: Vec<String> = remaining
                .iter()
                .filter(|id| {
                    by_id[*id].depends_on.iter().all(|dep| completed.contains_key(dep))
                })
                .cloned()
                .collect();

            if ready.is_empty() {
                // Every remaining step depends on one still pending but not
                // ready; validate() already ruled out a true cycle, so this
                // only happens if an earlier dependency never got scheduled
                // (e.g. cancellation mid-wave). Stop rather than spin.
                break;
            }

            let wave = futures::future::join_all(ready.iter().map(|id| self.run_step(&by_id[id], query))).await;

            for (id, result) in ready.into_iter().zip(wave) {
                remaining.remove(&id);
                completed.insert(id, result.clone());
                results.push(result);
            }
        }

        Ok(results)
    }

    #[tracing::instrument(skip(self, step, query), fields(query_id = %query.query_id, step_id = %step.step_id))]
    async fn run_step(&self, step: &Step, query: &Query) -> StepResult {
        let started_at = Utc::now();
        tracing::debug!(agent = %step.agent, tool = ?step.tool_name, "step started");
        self.streaming
            .publish(
                &query.query_id,
                ConductorEvent::StepStart {
                    step_id: step.step_id.clone(),
                    agent: step.agent.clone(),
                    tool_name: step.tool_name.clone(),
                },
            )
            .await;

        let mut attempt = 0;
        loop {
            let effective_timeout = Duration::from_millis(step.timeout_ms).min(query.remaining());
            let outcome = self.try_once(step, query, effective_timeout).await;

            let retryable = matches!(outcome.status, StepStatus::Timeout | StepStatus::Failed);
            let can_retry = attempt < step.retries && query.remaining() >= Duration::from_millis(100);

            if retryable && can_retry {
                tracing::warn!(attempt, status = ?outcome.status, "step retrying");
            } else {
                tracing::debug!(status = ?outcome.status, "step ended");
                let ended_at = Utc::now();
                let ms = (ended_at - started_at).num_milliseconds().max(0) as u64;
                self.streaming
                    .publish(
                        &query.query_id,
                        ConductorEvent::StepEnd {
                            step_id: step.step_id.clone(),
                            status: outcome.status,
                            ms,
                            tokens_in: outcome.tokens_in,
                            tokens_out: outcome.tokens_out,
                        },
                    )
                    .await;
                return StepResult { started_at, ended_at, ..outcome };
            }
            attempt += 1;
        }
    }

    async fn try_once(&self, step: &Step, query: &Query, timeout: Duration) -> StepResult {
        let now = Utc::now();
        if query.is_cancelled() {
            return StepResult {
                step_id: step.step_id.clone(),
                status: StepStatus::Cancelled,
                output: serde_json::Value::Null,
                error: None,
                started_at: now,
                ended_at: now,
                tokens_in: 0,
                tokens_out: 0,
                tool_calls: Vec::new(),
            };
        }

        let lease = match self.pool.lease(&step.agent, query.query_id.clone(), timeout).await {
            Ok(lease) => lease,
            Err(err) => {
                return StepResult {
                    step_id: step.step_id.clone(),
                    status: StepStatus::Failed,
                    output: serde_json::Value::Null,
                    error: Some(err.to_string()),
                    started_at: now,
                    ended_at: Utc::now(),
                    tokens_in: 0,
                    tokens_out: 0,
                    tool_calls: Vec::new(),
                };
            }
        };

        let ctx = ToolCallContext { trace_id: lease.trace_id.clone(), query_id: query.query_id.clone() };
        let agent = lease.agent.clone();
        let invocation = tokio::time::timeout(timeout, agent.handle_step(step, &self.tools, &ctx)).await;
        self.pool.return_lease(lease, 1).await;

        let tool_calls = step
            .tool_name
            .as_ref()
            .map(|name| vec![ToolCallRecord { tool_name: name.clone(), ok: matches!(&invocation, Ok(Ok(_))) }])
            .unwrap_or_default();

        match invocation {
            Ok(Ok(output)) => StepResult {
                step_id: step.step_id.clone(),
                status: StepStatus::Ok,
                output,
                error: None,
                started_at: now,
                ended_at: Utc::now(),
                tokens_in: 0,
                tokens_out: 0,
                tool_calls,
            },
            Ok(Err(err)) => StepResult {
                step_id: step.step_id.clone(),
                status: StepStatus::Failed,
                output: serde_json::Value::Null,
                error: Some(err.to_string()),
                started_at: now,
                ended_at: Utc::now(),
                tokens_in: 0,
                tokens_out: 0,
                tool_calls,
            },
            Err(_elapsed) => StepResult {
                step_id: step.step_id.clone(),
                status: StepStatus::Timeout,
                output: serde_json::Value::Null,
                error: Some(format!("step {} timed out after {:?}", step.step_id, timeout)),
                started_at: now,
                ended_at: Utc::now(),
                tokens_in: 0,
                tokens_out: 0,
                tool_calls,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgentDescriptor, PlanStrategy};
    use crate::pool::Agent;
    use crate::tools::{EchoTool, SlowTool};
    use async_trait::async_trait;

    struct StubAgent(String);
    #[async_trait]
    impl Agent for StubAgent {
        fn name(&self) -> &str {
            &self.0
        }
    }

    fn descriptor(name: &str) -> AgentDescriptor {
        AgentDescriptor { name: name.to_string(), capabilities: Default::default(), tools: vec![], model_preference: None, warmup: true, max_concurrent: 4 }
    }

    fn step(id: &str, depends_on: &[&str], tool_name: Option<&str>) -> Step {
        Step {
            step_id: id.to_string(),
            agent: "worker".to_string(),
            tool_name: tool_name.map(str::to_string),
            inputs: serde_json::json!({ "n": id }),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            timeout_ms: 5_000,
            retries: 0,
        }
    }

    fn setup() -> (PlanExecutor, Arc<AgentPool>) {
        let pool = Arc::new(AgentPool::new(1000, Duration::from_secs(3600)));
        pool.register(descriptor("worker"), 1, Arc::new(|| Arc::new(StubAgent("worker".into())) as Arc<dyn Agent>));
        let tools = Arc::new(ToolRegistry::new());
        tools.register(Arc::new(EchoTool::new("echo", 1000))).unwrap();
        tools.register(Arc::new(SlowTool::new("slow", 10, 500))).unwrap();
        let streaming = Arc::new(StreamingFabric::new(64, 100, Duration::from_secs(60)));
        let executor = PlanExecutor::new(pool.clone(), tools, streaming);
        (executor, pool)
    }

    /// **Scenario (spec §8 property 1)**: a plan with a dependency cycle is
    /// rejected before any step runs.
    #[test]
    fn cyclic_plan_is_rejected() {
        let plan = Plan::new("q1", vec![step("a", &["b"], None), step("b", &["a"], None)], PlanStrategy::Graph);
        let err = validate(&plan).unwrap_err();
        assert!(matches!(err, PlanError::CycleDetected(_)));
    }

    #[test]
    fn duplicate_step_id_is_rejected() {
        let plan = Plan::new("q1", vec![step("a", &[], None), step("a", &[], None)], PlanStrategy::Sequential);
        let err = validate(&plan).unwrap_err();
        assert!(matches!(err, PlanError::DuplicateStepId(_)));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let plan = Plan::new("q1", vec![step("a", &["ghost"], None)], PlanStrategy::Sequential);
        let err = validate(&plan).unwrap_err();
        assert!(matches!(err, PlanError::UnknownDependency { .. }));
    }

    /// **Scenario**: independent steps with no mutual dependency both
    /// complete; a downstream step only runs after its dependency does.
    #[tokio::test]
    async fn dependent_step_runs_after_its_dependency_completes() {
        let (executor, _pool) = setup();
        let plan = Plan::new(
            "q1",
            vec![step("a", &[], Some("echo")), step("b", &["a"], Some("echo"))],
            PlanStrategy::Graph,
        );
        let query = Query::new("hi", 5_000);
        let results = executor.execute(&plan, &query).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| matches!(r.status, StepStatus::Ok)));
        let a_end = results.iter().find(|r| r.step_id == "a").unwrap().ended_at;
        let b_start = results.iter().find(|r| r.step_id == "b").unwrap().started_at;
        assert!(b_start >= a_end);
    }

    /// **Scenario (spec §8 S3)**: a step whose tool exceeds its declared
    /// timeout is reported with `status = timeout`, not silently dropped.
    #[tokio::test]
    async fn slow_tool_step_ends_with_timeout_status() {
        let (executor, _pool) = setup();
        let plan = Plan::new("q1", vec![step("a", &[], Some("slow"))], PlanStrategy::Sequential);
        let query = Query::new("hi", 5_000);
        let results = executor.execute(&plan, &query).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0].status, StepStatus::Timeout));
    }

    /// **Scenario (spec §8 S4)**: a query cancelled before execution starts
    /// schedules no steps at all.
    #[tokio::test]
    async fn cancelled_query_schedules_no_steps() {
        let (executor, _pool) = setup();
        let plan = Plan::new("q1", vec![step("a", &[], Some("echo"))], PlanStrategy::Sequential);
        let query = Query::new("hi", 5_000);
        query.cancel.cancel();
        let results = executor.execute(&plan, &query).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn empty_plan_is_rejected() {
        let plan = Plan::new("q1", vec![], PlanStrategy::Sequential);
        assert!(matches!(validate(&plan), Err(PlanError::Empty)));
    }
}
