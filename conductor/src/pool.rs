//! Agent Pool: lease named specialist agents from a bounded, warm,
//! concurrency-controlled registry (spec §4.E). No teacher file implements a
//! leasing pool directly; concurrency primitives follow the corpus's general
//! `dashmap`-keyed-by-name-plus-async-mutex discipline (cf.
//! `tool_source/context.rs`, `memory/mod.rs`'s per-backend handle pattern).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, PoolError};
use crate::model::{AgentDescriptor, AnalysisResult, RouteDecision, Step};
use crate::tools::{ToolCallContext, ToolRegistry};

/// A typed worker capable of handling a task (analysis, research,
/// synthesis, code, data, writing, tool-use). The Agent Pool sees only this
/// interface (spec §9: interface-typed worker, not a class hierarchy); a
/// specialization overrides whichever of `handle_analyze`/`handle_route`/
/// `handle_step` it actually refines and leans on the default
/// implementations — shared behavior, not a base class — for the rest.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;
    /// Cheap self-check; a failing instance is discarded and replaced.
    async fn health_check(&self) -> bool {
        true
    }

    /// Refines the orchestrator's analysis; the default accepts it
    /// unchanged, which is the right behavior for an agent with no
    /// domain-specific reclassification to contribute.
    async fn handle_analyze(&self, analysis: AnalysisResult) -> Result<AnalysisResult, AgentError> {
        Ok(analysis)
    }

    /// Confirms or defers routing; the default confirms itself with no
    /// fallback preference.
    async fn handle_route(&self, _analysis: &AnalysisResult) -> Result<RouteDecision, AgentError> {
        Ok(RouteDecision { agent: self.name().to_string(), fallbacks: Vec::new() })
    }

    /// Executes one plan step and returns its output payload. The default
    /// dispatches to the named tool via the registry when the step declares
    /// one, and passes the step's inputs through unchanged otherwise; a
    /// specialization that performs its own reasoning (rather than a pure
    /// tool call) overrides this.
    async fn handle_step(
        &self,
        step: &Step,
        tools: &ToolRegistry,
        ctx: &ToolCallContext,
    ) -> Result<serde_json::Value, AgentError> {
        match &step.tool_name {
            Some(tool_name) => tools
                .invoke(tool_name, step.inputs.clone(), ctx)
                .await
                .map_err(|err| AgentError::Failed { agent: self.name().to_string(), reason: err.to_string() }),
            None => Ok(step.inputs.clone()),
        }
    }
}

/// Factory for one agent name; used both for warm-pool eager creation and
/// lazy on-demand creation up to `maxConcurrent`.
pub trait AgentFactory: Send + Sync {
    fn create(&self) -> Arc<dyn Agent>;
}

impl<F> AgentFactory for F
where
    F: Fn() -> Arc<dyn Agent> + Send + Sync,
{
    fn create(&self) -> Arc<dyn Agent> {
        self()
    }
}

struct PooledInstance {
    agent: Arc<dyn Agent>,
    created_at: Instant,
    operations: AtomicUsize,
}

/// An exclusive, time-bounded hold on an agent instance. Carries a context
/// with deadline/cancellation and a trace id; the caller tracks its own
/// token/tool budget against the lease. The permit is released when the
/// lease is dropped; the instance itself is only recycled into the warm
/// pool (or retired) via an explicit [`AgentPool::return_lease`] call (spec
/// §4.E: `Lease`/`Return`), never implicitly on drop.
pub struct Lease {
    pub agent: Arc<dyn Agent>,
    pub trace_id: String,
    pub cancel: CancellationToken,
    _permit: OwnedSemaphorePermit,
    name: String,
    instance_created_at: Instant,
}

struct AgentPoolInner {
    retire_after_ops: usize,
    retire_after: Duration,
    warm: DashMap<String, Mutex<VecDeque<PooledInstance>>>,
    retired: AtomicU64,
}

struct PerAgentState {
    semaphore: Arc<Semaphore>,
    descriptor: AgentDescriptor,
    factory: Arc<dyn AgentFactory>,
}

/// Bounded, leasing, concurrency-controlled worker registry (spec §4.E).
/// Each registered agent name has its own bounded semaphore (`maxConcurrent`)
/// and a warm pool of at least `minIdle` pre-initialized instances. Waiters
/// for the same agent name are served FIFO by tokio's semaphore.
pub struct AgentPool {
    agents: DashMap<String, Arc<PerAgentState>>,
    inner: Arc<AgentPoolInner>,
}

impl AgentPool {
    pub fn new(retire_after_ops: usize, retire_after: Duration) -> Self {
        Self {
            agents: DashMap::new(),
            inner: Arc::new(AgentPoolInner {
                retire_after_ops,
                retire_after,
                warm: DashMap::new(),
                retired: AtomicU64::new(0),
            }),
        }
    }

    /// Registers an agent name with its descriptor and factory, then
    /// eagerly creates up to `minIdle` warm instances.
    pub fn register(&self, descriptor: AgentDescriptor, min_idle: usize, factory: Arc<dyn AgentFactory>) {
        let state = Arc::new(PerAgentState {
            semaphore: Arc::new(Semaphore::new(descriptor.max_concurrent)),
            descriptor: descriptor.clone(),
            factory: factory.clone(),
        });
        self.agents.insert(descriptor.name.clone(), state);

        let mut queue = VecDeque::new();
        for _ in 0..min_idle.min(descriptor.max_concurrent) {
            queue.push_back(PooledInstance {
                agent: factory.create(),
                created_at: Instant::now(),
                operations: AtomicUsize::new(0),
            });
        }
        self.inner.warm.insert(descriptor.name.clone(), Mutex::new(queue));
    }

    /// Leases an instance of the named agent, waiting up to `wait_budget`
    /// for a free concurrency slot. Returns `poolExhausted` if the wait
    /// budget elapses first (spec §4.E failure semantics). Waiters queue
    /// FIFO per agent name via tokio's fair semaphore.
    pub async fn lease(&self, name: &str, trace_id: impl Into<String>, wait_budget: Duration) -> Result<Lease, PoolError> {
        let state = self.agents.get(name).map(|e| e.clone()).ok_or_else(|| PoolError::UnknownAgent(name.to_string()))?;

        let permit = tokio::time::timeout(wait_budget, state.semaphore.clone().acquire_owned())
            .await
            .map_err(|_| PoolError::LeaseTimeout(name.to_string()))?
            .map_err(|_| PoolError::ShuttingDown)?;

        let instance = self.take_or_create(name, &state).await;

        Ok(Lease {
            agent: instance.agent,
            trace_id: trace_id.into(),
            cancel: CancellationToken::new(),
            _permit: permit,
            name: name.to_string(),
            instance_created_at: instance.created_at,
        })
    }

    async fn take_or_create(&self, name: &str, state: &PerAgentState) -> PooledInstance {
        if let Some(queue) = self.inner.warm.get(name) {
            let mut queue = queue.lock().await;
            if let Some(healthy) = self.pop_healthy(&mut queue).await {
                return healthy;
            }
        }
        PooledInstance {
            agent: state.factory.create(),
            created_at: Instant::now(),
            operations: AtomicUsize::new(0),
        }
    }

    async fn pop_healthy(&self, queue: &mut VecDeque<PooledInstance>) -> Option<PooledInstance> {
        while let Some(instance) = queue.pop_front() {
            if instance.agent.health_check().await {
                return Some(instance);
            }
            // unhealthy instance discarded; loop tries the next one
        }
        None
    }

    /// Returns a lease's instance to the warm pool for its agent name so a
    /// later lease can reuse it, unless it has been used for `operations`
    /// (cumulative call-sites may report more than one) or has aged past its
    /// retirement budget, in which case it is dropped and counted as retired
    /// instead (spec §4.E: `Return(lease)`, cleanup on operation/age budget).
    /// The semaphore permit backing the lease is released when `lease` is
    /// dropped at the end of this call.
    pub async fn return_lease(&self, lease: Lease, operations: usize) {
        let exhausted = operations >= self.inner.retire_after_ops
            || lease.instance_created_at.elapsed() >= self.inner.retire_after;
        if exhausted {
            self.inner.retired.fetch_add(1, Ordering::SeqCst);
            return;
        }
        if let Some(queue) = self.inner.warm.get(&lease.name) {
            queue.lock().await.push_back(PooledInstance {
                agent: lease.agent.clone(),
                created_at: lease.instance_created_at,
                operations: AtomicUsize::new(operations),
            });
        }
    }

    pub fn retired_count(&self) -> u64 {
        self.inner.retired.load(Ordering::SeqCst)
    }

    pub fn descriptor(&self, name: &str) -> Option<AgentDescriptor> {
        self.agents.get(name).map(|e| e.descriptor.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct StubAgent {
        name: String,
        healthy: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Agent for StubAgent {
        fn name(&self) -> &str {
            &self.name
        }
        async fn health_check(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    fn descriptor(name: &str, max_concurrent: usize) -> AgentDescriptor {
        AgentDescriptor {
            name: name.to_string(),
            capabilities: Default::default(),
            tools: vec![],
            model_preference: None,
            warmup: true,
            max_concurrent,
        }
    }

    #[tokio::test]
    async fn lease_respects_bounded_concurrency() {
        let pool = AgentPool::new(1000, Duration::from_secs(3600));
        let healthy = Arc::new(AtomicBool::new(true));
        let healthy2 = healthy.clone();
        pool.register(
            descriptor("writer", 1),
            1,
            Arc::new(move || Arc::new(StubAgent { name: "writer".into(), healthy: healthy2.clone() }) as Arc<dyn Agent>),
        );

        let lease1 = pool.lease("writer", "trace-1", Duration::from_millis(50)).await.unwrap();
        let second = pool.lease("writer", "trace-2", Duration::from_millis(50)).await;
        assert!(matches!(second, Err(PoolError::LeaseTimeout(_))));
        drop(lease1);
    }

    #[tokio::test]
    async fn unknown_agent_name_is_rejected() {
        let pool = AgentPool::new(1000, Duration::from_secs(3600));
        let err = pool.lease("ghost", "trace", Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, PoolError::UnknownAgent(_)));
    }

    #[tokio::test]
    async fn warm_pool_creates_min_idle_instances_eagerly() {
        let pool = AgentPool::new(1000, Duration::from_secs(3600));
        let healthy = Arc::new(AtomicBool::new(true));
        pool.register(
            descriptor("research", 3),
            2,
            Arc::new({
                let healthy = healthy.clone();
                move || Arc::new(StubAgent { name: "research".into(), healthy: healthy.clone() }) as Arc<dyn Agent>
            }),
        );
        // Leasing up to min_idle should never block on factory creation latency
        // (covered implicitly: creation is instant in this stub either way, but
        // the warm queue should have entries to pop from immediately).
        let lease = pool.lease("research", "t", Duration::from_millis(50)).await.unwrap();
        assert_eq!(lease.agent.name(), "research");
    }

    /// **Scenario (spec §4.E `Return(lease)`)**: returning a lease recycles
    /// the same instance into the warm pool instead of forcing every
    /// subsequent lease to pay factory-creation cost.
    #[tokio::test]
    async fn returned_lease_is_recycled_into_warm_pool() {
        let pool = AgentPool::new(1000, Duration::from_secs(3600));
        let healthy = Arc::new(AtomicBool::new(true));
        pool.register(
            descriptor("writer", 1),
            1,
            Arc::new({
                let healthy = healthy.clone();
                move || Arc::new(StubAgent { name: "writer".into(), healthy: healthy.clone() }) as Arc<dyn Agent>
            }),
        );

        let lease = pool.lease("writer", "t1", Duration::from_millis(50)).await.unwrap();
        let first_instance = lease.agent.clone();
        pool.return_lease(lease, 1).await;

        let lease2 = pool.lease("writer", "t2", Duration::from_millis(50)).await.unwrap();
        assert!(Arc::ptr_eq(&lease2.agent, &first_instance));
    }

    /// **Scenario (spec §4.E cleanup)**: a lease used past its operation
    /// budget is retired rather than recycled.
    #[tokio::test]
    async fn lease_past_operation_budget_is_retired_not_recycled() {
        let pool = AgentPool::new(1, Duration::from_secs(3600));
        let healthy = Arc::new(AtomicBool::new(true));
        pool.register(
            descriptor("writer", 1),
            1,
            Arc::new({
                let healthy = healthy.clone();
                move || Arc::new(StubAgent { name: "writer".into(), healthy: healthy.clone() }) as Arc<dyn Agent>
            }),
        );

        let lease = pool.lease("writer", "t1", Duration::from_millis(50)).await.unwrap();
        let first_instance = lease.agent.clone();
        pool.return_lease(lease, 1).await;
        assert_eq!(pool.retired_count(), 1);

        let lease2 = pool.lease("writer", "t2", Duration::from_millis(50)).await.unwrap();
        assert!(!Arc::ptr_eq(&lease2.agent, &first_instance));
    }
}
