use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::{
    sync::{Mutex, OwnedMutexGuard},
    task::{AbortHandle, JoinHandle},
    time::MissedTickBehavior,
};

use crate::{
    events::{ErrorReason, EventBus, ProgressReporter, WorkflowEvent},
    invoker::{AgentInvoker, AgentRequest, InvokerError, PriorResult},
    store::{StateKey, StoreError, WorkflowStore},
    types::{
        StartWorkflowRequest, StepRecord, StepResultRecord, StepStatus, WorkflowRecord,
        WorkflowStatus,
    },
    Result, WorkflowError,
};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Deadline for a single agent invocation. `None` waits forever.
    pub step_timeout: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            step_timeout: Some(Duration::from_secs(300)),
        }
    }
}

const MIN_SWEEP_PERIOD: Duration = Duration::from_secs(1);
const MAX_SWEEP_PERIOD: Duration = Duration::from_secs(30);

impl OrchestratorConfig {
    /// How often to look for steps past their deadline with nothing running.
    /// `None` when steps have no deadline.
    pub fn sweep_period(&self) -> Option<Duration> {
        self.step_timeout
            .map(|limit| limit.clamp(MIN_SWEEP_PERIOD, MAX_SWEEP_PERIOD))
    }
}

/// The invocation currently running for a workflow.
struct InFlight {
    index: usize,
    attempt: u32,
    handle: AbortHandle,
    live: Arc<AtomicBool>,
}

impl InFlight {
    fn retire(&self) {
        self.live.store(false, Ordering::Release);
    }

    fn stop(self) {
        self.retire();
        self.handle.abort();
    }
}

enum StepOutcome {
    Resolved(Value),
    Rejected(InvokerError),
    TimedOut(Duration),
}

struct Inner {
    store: Arc<dyn WorkflowStore>,
    invoker: Arc<dyn AgentInvoker>,
    events: EventBus,
    config: OrchestratorConfig,
    in_flight: DashMap<String, InFlight>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Owns the workflow lifecycle: creation, strictly sequential step dispatch,
/// result persistence and terminal transitions.
///
/// Every mutation of a workflow runs under that workflow's lock; agent
/// invocations run in spawned tasks outside of it.
#[derive(Clone)]
pub struct WorkflowOrchestrator {
    inner: Arc<Inner>,
}

impl WorkflowOrchestrator {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        invoker: Arc<dyn AgentInvoker>,
        events: EventBus,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                invoker,
                events,
                config,
                in_flight: DashMap::new(),
                locks: DashMap::new(),
            }),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn store(&self) -> Arc<dyn WorkflowStore> {
        Arc::clone(&self.inner.store)
    }

    /// Index of the step whose invocation is currently running.
    pub fn in_flight_step(&self, id: &str) -> Option<usize> {
        self.inner.in_flight.get(id).map(|flight| flight.index)
    }

    pub async fn get_workflow(&self, id: &str) -> Result<WorkflowRecord> {
        self.load(id).await
    }

    pub async fn list_workflows(&self, limit: usize) -> Result<Vec<WorkflowRecord>> {
        Ok(self.inner.store.list_workflows(limit).await?)
    }

    /// Validate and persist a new workflow, then dispatch its first step.
    ///
    /// The workflow record and the step 0 dispatch are written atomically. A
    /// workflow without agents is created already completed.
    pub async fn start_workflow(&self, request: StartWorkflowRequest) -> Result<WorkflowRecord> {
        let plan = request.into_plan()?;
        let now = Utc::now();
        let empty = plan.steps.is_empty();

        let workflow = WorkflowRecord {
            id: plan.id,
            user_id: plan.user_id,
            message: plan.message,
            agents: plan.steps,
            context: plan.context,
            stream_key: plan.stream_key,
            status: if empty {
                WorkflowStatus::Completed
            } else {
                WorkflowStatus::Processing
            },
            started_at: now,
            updated_at: now,
            completed_at: empty.then_some(now),
            error: None,
        };
        let first_step = workflow
            .agents
            .first()
            .map(|step| StepRecord::dispatched(&workflow.id, 0, step, now));

        let _guard = self.lock_for(&workflow.id).lock_owned().await;

        match self
            .inner
            .store
            .create_workflow(&workflow, first_step.as_ref())
            .await
        {
            Ok(()) => {}
            Err(StoreError::Duplicate(id)) => {
                // Only a workflow that can still change keeps its lock entry
                let existing = self.inner.store.get_workflow(&id).await?;
                if existing.map_or(true, |existing| existing.is_terminal()) {
                    self.release(&id);
                }
                return Err(WorkflowError::AlreadyExists(id));
            }
            Err(other) => {
                tracing::error!(
                    "[WORKFLOW_ORCHESTRATOR] Failed to persist workflow {}: {}",
                    workflow.id,
                    other
                );
                self.release(&workflow.id);
                return Err(other.into());
            }
        }

        tracing::info!(
            "[WORKFLOW_ORCHESTRATOR] Started workflow {} for user {} with {} steps",
            workflow.id,
            workflow.user_id,
            workflow.total_steps()
        );

        self.emit(
            &workflow,
            WorkflowEvent::Started {
                workflow_id: workflow.id.clone(),
                user_id: workflow.user_id.clone(),
                agents: workflow.agents.iter().map(|step| step.agent).collect(),
                total_steps: workflow.total_steps(),
                timestamp: now,
            },
        );

        if empty {
            self.emit(
                &workflow,
                WorkflowEvent::Completed {
                    workflow_id: workflow.id.clone(),
                    results: Vec::new(),
                    timestamp: now,
                },
            );
            self.release(&workflow.id);
            return Ok(workflow);
        }

        self.emit_step_started(&workflow, 0, 1);
        self.dispatch(&workflow, 0, 1, Vec::new());
        Ok(workflow)
    }

    /// Record the result of the in-flight step delivered from outside, for
    /// agents that complete out of process. Any local invocation of that
    /// step is aborted.
    ///
    /// Re-delivering an identical result is a no-op; a different payload for
    /// an already completed step is rejected.
    pub async fn advance_workflow(
        &self,
        id: &str,
        index: usize,
        result: Value,
    ) -> Result<WorkflowRecord> {
        let (_guard, workflow) = self.acquire(id).await?;

        if index >= workflow.total_steps() {
            return Err(WorkflowError::OutOfOrder {
                workflow_id: id.to_string(),
                index,
            });
        }

        if let Some(existing) = self.inner.store.get_result(id, index).await? {
            if existing.result == result {
                tracing::debug!(
                    "[WORKFLOW_ORCHESTRATOR] Duplicate result for step {} of {} ignored",
                    index,
                    id
                );
                return Ok(workflow);
            }
            return Err(WorkflowError::ConflictingResult {
                workflow_id: id.to_string(),
                index,
            });
        }

        if workflow.is_terminal() {
            return Err(WorkflowError::Terminal {
                workflow_id: id.to_string(),
                status: workflow.status,
            });
        }

        match self.current_step(&workflow).await? {
            Some((current, true)) if current == index => {}
            _ => {
                return Err(WorkflowError::OutOfOrder {
                    workflow_id: id.to_string(),
                    index,
                })
            }
        }

        if let Some(flight) = self.take_in_flight(id) {
            flight.stop();
        }
        self.complete_step(workflow, index, result).await
    }

    /// Move a workflow to `cancelled`. Persisted results are kept. Cancelling
    /// a terminal workflow returns it unchanged.
    pub async fn cancel_workflow(&self, id: &str) -> Result<WorkflowRecord> {
        let (_guard, mut workflow) = self.acquire(id).await?;
        if workflow.is_terminal() {
            return Ok(workflow);
        }

        let step_index = match self.take_in_flight(id) {
            Some(flight) => {
                let index = flight.index;
                flight.stop();
                Some(index)
            }
            None => self.current_step(&workflow).await?.map(|(index, _)| index),
        };

        let now = Utc::now();
        let message = "Workflow cancelled".to_string();
        workflow.status = WorkflowStatus::Cancelled;
        workflow.error = Some(message.clone());
        workflow.updated_at = now;
        workflow.completed_at = Some(now);
        self.inner.store.update_workflow(&workflow).await?;

        tracing::info!("[WORKFLOW_ORCHESTRATOR] Cancelled workflow {}", id);
        self.emit(
            &workflow,
            WorkflowEvent::Error {
                workflow_id: workflow.id.clone(),
                step_index,
                agent: step_index.map(|index| workflow.agents[index].agent),
                error: message,
                reason: ErrorReason::Cancelled,
                timestamp: now,
            },
        );
        self.release(id);
        Ok(workflow)
    }

    /// Dispatch the current step again after its invocation failed. The
    /// attempt counter is bumped and the original start time kept.
    pub async fn retry_step(&self, id: &str, index: usize) -> Result<WorkflowRecord> {
        let (_guard, workflow) = self.acquire(id).await?;
        if workflow.is_terminal() {
            return Err(WorkflowError::Terminal {
                workflow_id: id.to_string(),
                status: workflow.status,
            });
        }
        if index >= workflow.total_steps() {
            return Err(WorkflowError::OutOfOrder {
                workflow_id: id.to_string(),
                index,
            });
        }

        let not_stuck = || WorkflowError::StepNotStuck {
            workflow_id: id.to_string(),
            index,
        };
        if self.inner.in_flight.contains_key(id) {
            return Err(not_stuck());
        }
        match self.current_step(&workflow).await? {
            Some((current, _)) if current == index => {}
            _ => return Err(not_stuck()),
        }

        let now = Utc::now();
        let step = match self.inner.store.get_step(id, index).await? {
            Some(mut step) => {
                step.attempt += 1;
                step.status = StepStatus::Processing;
                step.error = None;
                step.failed_at = None;
                step
            }
            None => StepRecord::dispatched(id, index, &workflow.agents[index], now),
        };
        self.inner.store.put_step(&step).await?;
        let previous = self.collect_results(&workflow, index).await?;

        tracing::info!(
            "[WORKFLOW_ORCHESTRATOR] Retrying step {} of {} (attempt {})",
            index,
            id,
            step.attempt
        );
        self.emit_step_started(&workflow, index, step.attempt);
        self.dispatch(&workflow, index, step.attempt, previous);
        Ok(workflow)
    }

    /// Mark a non-terminal workflow and its current step `failed`.
    pub async fn fail_workflow(&self, id: &str, reason: &str) -> Result<WorkflowRecord> {
        let (_guard, mut workflow) = self.acquire(id).await?;
        if workflow.is_terminal() {
            return Err(WorkflowError::Terminal {
                workflow_id: id.to_string(),
                status: workflow.status,
            });
        }

        let step_index = match self.take_in_flight(id) {
            Some(flight) => {
                let index = flight.index;
                flight.stop();
                Some(index)
            }
            None => self.current_step(&workflow).await?.map(|(index, _)| index),
        };

        let now = Utc::now();
        if let Some(index) = step_index {
            if let Some(mut step) = self.inner.store.get_step(id, index).await? {
                step.status = StepStatus::Failed;
                step.error = Some(reason.to_string());
                step.failed_at = Some(now);
                self.inner.store.put_step(&step).await?;
            }
        }

        workflow.status = WorkflowStatus::Failed;
        workflow.error = Some(reason.to_string());
        workflow.updated_at = now;
        workflow.completed_at = Some(now);
        self.inner.store.update_workflow(&workflow).await?;

        tracing::warn!("[WORKFLOW_ORCHESTRATOR] Workflow {} failed by operator: {}", id, reason);
        self.emit(
            &workflow,
            WorkflowEvent::Error {
                workflow_id: workflow.id.clone(),
                step_index,
                agent: step_index.map(|index| workflow.agents[index].agent),
                error: reason.to_string(),
                reason: ErrorReason::OperatorFailed,
                timestamp: now,
            },
        );
        self.release(id);
        Ok(workflow)
    }

    /// Fail every `processing` step that is past its deadline while no
    /// invocation of it runs in this process, as left behind by a crash
    /// between dispatch and spawn or by a restart. Steps waiting for an
    /// operator after a failed invocation expire the same way.
    ///
    /// Returns the number of workflows failed.
    pub async fn sweep_deadlines(&self) -> Result<usize> {
        let Some(limit) = self.inner.config.step_timeout else {
            return Ok(0);
        };
        // A limit chrono cannot represent never expires
        let Ok(deadline) = chrono::Duration::from_std(limit) else {
            return Ok(0);
        };

        let mut expired = 0;
        for workflow in self
            .inner
            .store
            .list_by_status(WorkflowStatus::Processing)
            .await?
        {
            if self.inner.in_flight.contains_key(&workflow.id) {
                continue;
            }
            match self.expire_orphaned_step(&workflow.id, limit, deadline).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(err) => tracing::error!(
                    "[WORKFLOW_ORCHESTRATOR] Deadline check of workflow {} failed: {}",
                    workflow.id,
                    err
                ),
            }
        }
        Ok(expired)
    }

    /// Run [`Self::sweep_deadlines`] every `period`, the first time right away.
    pub fn spawn_deadline_sweep(&self, period: Duration) -> JoinHandle<()> {
        let this = self.clone();
        let period = period.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match this.sweep_deadlines().await {
                    Ok(0) => {}
                    Ok(expired) => tracing::info!(
                        "[WORKFLOW_ORCHESTRATOR] Failed {} workflows with expired steps",
                        expired
                    ),
                    Err(err) => {
                        tracing::error!("[WORKFLOW_ORCHESTRATOR] Deadline sweep failed: {}", err)
                    }
                }
            }
        })
    }

    async fn expire_orphaned_step(
        &self,
        id: &str,
        limit: Duration,
        deadline: chrono::Duration,
    ) -> Result<bool> {
        let (_guard, workflow) = self.acquire(id).await?;
        if workflow.is_terminal() || self.inner.in_flight.contains_key(id) {
            return Ok(false);
        }
        let Some((index, true)) = self.current_step(&workflow).await? else {
            return Ok(false);
        };
        let Some(step) = self.inner.store.get_step(id, index).await? else {
            return Ok(false);
        };
        if step.status != StepStatus::Processing {
            return Ok(false);
        }
        match step.started_at.checked_add_signed(deadline) {
            Some(due) if due <= Utc::now() => {}
            _ => return Ok(false),
        }

        tracing::warn!(
            "[WORKFLOW_ORCHESTRATOR] Step {} of {} expired with no running invocation",
            index,
            id
        );
        self.record_timeout(workflow, index, limit).await?;
        Ok(true)
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        self.inner.locks.entry(id.to_string()).or_default().clone()
    }

    fn release(&self, id: &str) {
        self.inner.locks.remove(id);
    }

    fn take_in_flight(&self, id: &str) -> Option<InFlight> {
        self.inner.in_flight.remove(id).map(|(_, flight)| flight)
    }

    async fn load(&self, id: &str) -> Result<WorkflowRecord> {
        self.inner
            .store
            .get_workflow(id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(id.to_string()))
    }

    /// Take the workflow lock and read the record under it. Unknown ids fail
    /// before a lock entry is created.
    async fn acquire(&self, id: &str) -> Result<(OwnedMutexGuard<()>, WorkflowRecord)> {
        self.load(id).await?;
        let guard = self.lock_for(id).lock_owned().await;
        let workflow = self.load(id).await?;
        if workflow.is_terminal() {
            self.release(id);
        }
        Ok((guard, workflow))
    }

    /// First step without a result, and whether it has been dispatched.
    async fn current_step(&self, workflow: &WorkflowRecord) -> Result<Option<(usize, bool)>> {
        for index in 0..workflow.total_steps() {
            if self.inner.store.get_result(&workflow.id, index).await?.is_none() {
                let dispatched = self.inner.store.get_step(&workflow.id, index).await?.is_some();
                return Ok(Some((index, dispatched)));
            }
        }
        Ok(None)
    }

    async fn collect_results(
        &self,
        workflow: &WorkflowRecord,
        upto: usize,
    ) -> Result<Vec<PriorResult>> {
        let mut results = Vec::with_capacity(upto);
        for index in 0..upto {
            let record = self
                .inner
                .store
                .get_result(&workflow.id, index)
                .await?
                .ok_or_else(|| {
                    StoreError::Missing(StateKey::Result(&workflow.id, index).to_string())
                })?;
            results.push(PriorResult {
                index,
                agent: workflow.agents[index].agent,
                result: record.result,
            });
        }
        Ok(results)
    }

    fn emit(&self, workflow: &WorkflowRecord, event: WorkflowEvent) {
        self.inner.events.emit(workflow.stream_key.as_deref(), event);
    }

    fn emit_step_started(&self, workflow: &WorkflowRecord, index: usize, attempt: u32) {
        let step = &workflow.agents[index];
        self.emit(
            workflow,
            WorkflowEvent::AgentStarted {
                workflow_id: workflow.id.clone(),
                step_index: index,
                agent: step.agent,
                agent_name: step.agent.display_name().to_string(),
                task: step.task.clone(),
                attempt,
                timestamp: Utc::now(),
            },
        );
    }

    /// Spawn the invocation of a dispatched step. Must be called with the
    /// workflow lock held so the in-flight entry exists before the outcome
    /// is handled.
    fn dispatch(
        &self,
        workflow: &WorkflowRecord,
        index: usize,
        attempt: u32,
        previous_results: Vec<PriorResult>,
    ) {
        let step = &workflow.agents[index];
        let live = Arc::new(AtomicBool::new(true));
        let progress = ProgressReporter::new(
            self.inner.events.clone(),
            workflow.id.clone(),
            workflow.stream_key.clone(),
            index,
            step.agent,
            Arc::clone(&live),
        );
        let request = AgentRequest {
            workflow_id: workflow.id.clone(),
            step_index: index,
            attempt,
            agent: step.agent,
            task: step.task.clone(),
            message: workflow.message.clone(),
            context: workflow.context.clone(),
            previous_results,
        };

        tracing::debug!(
            "[WORKFLOW_ORCHESTRATOR] Dispatching step {} ({}) of {}",
            index,
            step.agent,
            workflow.id
        );

        let this = self.clone();
        let workflow_id = workflow.id.clone();
        let handle = tokio::spawn(async move {
            let outcome = this.run_invocation(request, progress).await;
            this.on_step_outcome(&workflow_id, index, attempt, outcome).await;
        });

        let flight = InFlight {
            index,
            attempt,
            handle: handle.abort_handle(),
            live,
        };
        if let Some(previous) = self.inner.in_flight.insert(workflow.id.clone(), flight) {
            previous.stop();
        }
    }

    async fn run_invocation(&self, request: AgentRequest, progress: ProgressReporter) -> StepOutcome {
        let call = self.inner.invoker.invoke(request, progress);
        let result = match self.inner.config.step_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => return StepOutcome::TimedOut(limit),
            },
            None => call.await,
        };
        match result {
            Ok(value) => StepOutcome::Resolved(value),
            Err(err) => StepOutcome::Rejected(err),
        }
    }

    /// Handle the end of a spawned invocation. Outcomes of invocations that
    /// were superseded (external advance, retry, cancel) are discarded.
    async fn on_step_outcome(&self, id: &str, index: usize, attempt: u32, outcome: StepOutcome) {
        let (_guard, workflow) = match self.acquire(id).await {
            Ok(acquired) => acquired,
            Err(err) => {
                tracing::error!(
                    "[WORKFLOW_ORCHESTRATOR] Cannot load workflow {} after step {}: {}",
                    id,
                    index,
                    err
                );
                return;
            }
        };

        let current = self
            .inner
            .in_flight
            .get(id)
            .map(|flight| (flight.index, flight.attempt));
        if current != Some((index, attempt)) {
            tracing::debug!(
                "[WORKFLOW_ORCHESTRATOR] Discarding stale outcome of step {} attempt {} of {}",
                index,
                attempt,
                id
            );
            return;
        }
        if let Some(flight) = self.take_in_flight(id) {
            flight.retire();
        }

        let stream_key = workflow.stream_key.clone();
        let agent = workflow.agents[index].agent;
        let handled = match outcome {
            StepOutcome::Resolved(value) => self.complete_step(workflow, index, value).await.map(|_| ()),
            StepOutcome::Rejected(err) => self.record_invocation_failure(&workflow, index, err).await,
            StepOutcome::TimedOut(limit) => self.record_timeout(workflow, index, limit).await,
        };

        if let Err(err) = handled {
            tracing::error!(
                "[WORKFLOW_ORCHESTRATOR] Failed to record outcome of step {} of {}: {}",
                index,
                id,
                err
            );
            self.inner.events.emit(
                stream_key.as_deref(),
                WorkflowEvent::Error {
                    workflow_id: id.to_string(),
                    step_index: Some(index),
                    agent: Some(agent),
                    error: err.to_string(),
                    reason: ErrorReason::PersistenceFailed,
                    timestamp: Utc::now(),
                },
            );
        }
    }

    /// Persist a step result, then dispatch the next step or complete the
    /// workflow. Caller holds the lock and has cleared the in-flight entry.
    async fn complete_step(
        &self,
        mut workflow: WorkflowRecord,
        index: usize,
        result: Value,
    ) -> Result<WorkflowRecord> {
        let now = Utc::now();
        self.inner
            .store
            .put_result(&StepResultRecord {
                workflow_id: workflow.id.clone(),
                index,
                result: result.clone(),
                completed_at: now,
            })
            .await?;
        if let Some(mut step) = self.inner.store.get_step(&workflow.id, index).await? {
            if step.error.is_some() {
                step.error = None;
                self.inner.store.put_step(&step).await?;
            }
        }

        let agent = workflow.agents[index].agent;
        tracing::info!(
            "[WORKFLOW_ORCHESTRATOR] Step {} ({}) of {} completed",
            index,
            agent,
            workflow.id
        );
        self.emit(
            &workflow,
            WorkflowEvent::AgentCompleted {
                workflow_id: workflow.id.clone(),
                step_index: index,
                agent,
                result,
                timestamp: now,
            },
        );

        let next = index + 1;
        if next < workflow.total_steps() {
            let previous = self.collect_results(&workflow, next).await?;
            let step = StepRecord::dispatched(&workflow.id, next, &workflow.agents[next], now);
            self.inner.store.put_step(&step).await?;
            self.emit_step_started(&workflow, next, 1);
            self.dispatch(&workflow, next, 1, previous);
            return Ok(workflow);
        }

        workflow.status = WorkflowStatus::Completed;
        workflow.updated_at = now;
        workflow.completed_at = Some(now);
        self.inner.store.update_workflow(&workflow).await?;

        let results = self
            .collect_results(&workflow, workflow.total_steps())
            .await?
            .into_iter()
            .map(|prior| prior.result)
            .collect();

        tracing::info!("[WORKFLOW_ORCHESTRATOR] Workflow {} completed", workflow.id);
        self.emit(
            &workflow,
            WorkflowEvent::Completed {
                workflow_id: workflow.id.clone(),
                results,
                timestamp: now,
            },
        );
        self.release(&workflow.id);
        Ok(workflow)
    }

    /// The step stays `processing` with the error noted; an operator decides
    /// between `retry_step` and `fail_workflow`.
    async fn record_invocation_failure(
        &self,
        workflow: &WorkflowRecord,
        index: usize,
        err: InvokerError,
    ) -> Result<()> {
        let message = err.to_string();
        if let Some(mut step) = self.inner.store.get_step(&workflow.id, index).await? {
            step.error = Some(message.clone());
            self.inner.store.put_step(&step).await?;
        }

        let agent = workflow.agents[index].agent;
        tracing::warn!(
            "[WORKFLOW_ORCHESTRATOR] Step {} ({}) of {} failed: {}",
            index,
            agent,
            workflow.id,
            message
        );
        self.emit(
            workflow,
            WorkflowEvent::Error {
                workflow_id: workflow.id.clone(),
                step_index: Some(index),
                agent: Some(agent),
                error: message,
                reason: ErrorReason::InvocationFailed,
                timestamp: Utc::now(),
            },
        );
        Ok(())
    }

    async fn record_timeout(
        &self,
        mut workflow: WorkflowRecord,
        index: usize,
        limit: Duration,
    ) -> Result<()> {
        let now = Utc::now();
        let agent = workflow.agents[index].agent;
        let message = format!(
            "Step {} ({}) timed out after {}s",
            index,
            agent,
            limit.as_secs_f64()
        );

        if let Some(mut step) = self.inner.store.get_step(&workflow.id, index).await? {
            step.status = StepStatus::Failed;
            step.error = Some(message.clone());
            step.failed_at = Some(now);
            self.inner.store.put_step(&step).await?;
        }

        workflow.status = WorkflowStatus::Failed;
        workflow.error = Some(message.clone());
        workflow.updated_at = now;
        workflow.completed_at = Some(now);
        self.inner.store.update_workflow(&workflow).await?;

        tracing::warn!("[WORKFLOW_ORCHESTRATOR] {} in workflow {}", message, workflow.id);
        self.emit(
            &workflow,
            WorkflowEvent::Error {
                workflow_id: workflow.id.clone(),
                step_index: Some(index),
                agent: Some(agent),
                error: message,
                reason: ErrorReason::Timeout,
                timestamp: now,
            },
        );
        self.release(&workflow.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        persona::AgentPersona,
        test_support::{drain, harness, sample_record, sample_step, wait_for_event, ScriptedInvoker},
    };

    fn request(id: &str, agents: &[&str]) -> StartWorkflowRequest {
        serde_json::from_value(json!({
            "workflowId": id,
            "userId": "user-1",
            "message": "How does AAPL look?",
            "agents": agents,
            "context": {"symbols": ["AAPL"]}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn start_persists_workflow_and_dispatches_first_step() {
        let mut h = harness(ScriptedInvoker::hanging_on(&[0]), None);

        let workflow = h
            .orchestrator
            .start_workflow(request("wf-1", &["analyst", "trader"]))
            .await
            .unwrap();

        assert_eq!(workflow.status, WorkflowStatus::Processing);
        assert_eq!(workflow.total_steps(), 2);
        assert!(h.store.get_step("wf-1", 0).await.unwrap().is_some());
        assert!(h.store.get_step("wf-1", 1).await.unwrap().is_none());
        assert_eq!(h.orchestrator.in_flight_step("wf-1"), Some(0));

        let names: Vec<_> = drain(&mut h.events).iter().map(|e| e.name()).collect();
        assert_eq!(&names[..2], &["workflow.started", "workflow.agent.started"]);
    }

    #[tokio::test]
    async fn steps_run_in_order_with_previous_results() {
        let mut h = harness(ScriptedInvoker::resolving(), None);

        h.orchestrator
            .start_workflow(request("wf-seq", &["analyst", "trader", "advisor"]))
            .await
            .unwrap();

        let completed = wait_for_event(&mut h.events, "wf-seq", "workflow.completed").await;
        let WorkflowEvent::Completed { results, .. } = completed else {
            panic!("expected completion");
        };
        assert_eq!(results.len(), 3);
        assert_eq!(results[2]["agent"], "advisor");

        let workflow = h.orchestrator.get_workflow("wf-seq").await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Completed);
        assert!(workflow.completed_at.is_some());

        // A step's dispatch never precedes the previous step's result
        for index in 1..3 {
            let previous = h.store.get_result("wf-seq", index - 1).await.unwrap().unwrap();
            let step = h.store.get_step("wf-seq", index).await.unwrap().unwrap();
            assert!(previous.completed_at <= step.started_at);
        }
        assert_eq!(h.orchestrator.in_flight_step("wf-seq"), None);
    }

    #[tokio::test]
    async fn invoker_receives_message_context_and_prior_results() {
        let invoker = ScriptedInvoker::resolving();
        let mut h = harness(invoker.clone(), None);

        h.orchestrator
            .start_workflow(request("wf-ctx", &["analyst", "risk-manager"]))
            .await
            .unwrap();
        wait_for_event(&mut h.events, "wf-ctx", "workflow.completed").await;

        let calls = invoker.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].step_index, 0);
        assert!(calls[0].previous_results.is_empty());
        assert_eq!(calls[1].agent, AgentPersona::RiskManager);
        assert_eq!(calls[1].context.symbols, vec!["AAPL"]);
        assert_eq!(calls[1].message, "How does AAPL look?");
        assert_eq!(calls[1].previous_results.len(), 1);
        assert_eq!(calls[1].previous_results[0].agent, AgentPersona::Analyst);
    }

    #[tokio::test]
    async fn progress_events_are_published_for_the_running_step() {
        let mut h = harness(ScriptedInvoker::hanging_on(&[0]), None);
        h.orchestrator
            .start_workflow(request("wf-prog", &["economist"]))
            .await
            .unwrap();

        let progress = wait_for_event(&mut h.events, "wf-prog", "workflow.agent.progress").await;
        let WorkflowEvent::AgentProgress {
            step_index, agent, ..
        } = progress
        else {
            panic!("expected progress");
        };
        assert_eq!(step_index, 0);
        assert_eq!(agent, AgentPersona::Economist);
    }

    #[tokio::test]
    async fn zero_agent_workflow_is_completed_immediately() {
        let mut h = harness(ScriptedInvoker::resolving(), None);

        let workflow = h
            .orchestrator
            .start_workflow(request("wf-empty", &[]))
            .await
            .unwrap();

        assert_eq!(workflow.status, WorkflowStatus::Completed);
        assert!(workflow.completed_at.is_some());
        let names: Vec<_> = drain(&mut h.events).iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["workflow.started", "workflow.completed"]);
    }

    #[tokio::test]
    async fn invalid_and_duplicate_requests_are_rejected() {
        let h = harness(ScriptedInvoker::hanging_on(&[0]), None);

        let err = h
            .orchestrator
            .start_workflow(request("wf-bad", &["astrologer"]))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidRequest(_)));
        assert!(h.store.is_empty(), "nothing persisted for malformed input");

        h.orchestrator
            .start_workflow(request("wf-dup", &["analyst"]))
            .await
            .unwrap();
        let err = h
            .orchestrator
            .start_workflow(request("wf-dup", &["trader"]))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::AlreadyExists(id) if id == "wf-dup"));
    }

    #[tokio::test]
    async fn duplicate_start_of_finished_workflow_leaves_no_lock_behind() {
        let h = harness(ScriptedInvoker::hanging_on(&[0]), None);
        h.orchestrator
            .start_workflow(request("wf-done", &[]))
            .await
            .unwrap();
        h.orchestrator
            .start_workflow(request("wf-live", &["analyst"]))
            .await
            .unwrap();

        for id in ["wf-done", "wf-live"] {
            let err = h
                .orchestrator
                .start_workflow(request(id, &["trader"]))
                .await
                .unwrap_err();
            assert!(matches!(err, WorkflowError::AlreadyExists(_)));
        }

        assert!(!h.orchestrator.inner.locks.contains_key("wf-done"));
        assert!(h.orchestrator.inner.locks.contains_key("wf-live"));
    }

    #[tokio::test]
    async fn external_advance_dispatches_next_step() {
        let h = harness(ScriptedInvoker::hanging_on(&[0, 1]), None);
        h.orchestrator
            .start_workflow(request("wf-ext", &["analyst", "trader"]))
            .await
            .unwrap();

        let payload = json!({"response": "Bullish on AAPL"});
        h.orchestrator
            .advance_workflow("wf-ext", 0, payload.clone())
            .await
            .unwrap();
        assert_eq!(h.orchestrator.in_flight_step("wf-ext"), Some(1));
        assert!(h.store.get_step("wf-ext", 1).await.unwrap().is_some());

        // Identical redelivery is accepted, a different payload is not
        h.orchestrator
            .advance_workflow("wf-ext", 0, payload)
            .await
            .unwrap();
        let err = h
            .orchestrator
            .advance_workflow("wf-ext", 0, json!({"response": "Bearish"}))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::ConflictingResult { index: 0, .. }));

        let done = h
            .orchestrator
            .advance_workflow("wf-ext", 1, json!({"response": "Buy 10 shares"}))
            .await
            .unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn advance_rejects_steps_out_of_order() {
        let h = harness(ScriptedInvoker::hanging_on(&[0]), None);
        h.orchestrator
            .start_workflow(request("wf-ooo", &["analyst", "trader"]))
            .await
            .unwrap();

        for index in [1, 2] {
            let err = h
                .orchestrator
                .advance_workflow("wf-ooo", index, json!({}))
                .await
                .unwrap_err();
            assert!(matches!(err, WorkflowError::OutOfOrder { .. }), "index {index}");
        }

        let err = h
            .orchestrator
            .advance_workflow("wf-missing", 0, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound(_)));
    }

    #[tokio::test]
    async fn invocation_failure_leaves_step_processing_until_retried() {
        let invoker = ScriptedInvoker::failing_on(&[0]);
        let mut h = harness(invoker.clone(), None);
        h.orchestrator
            .start_workflow(request("wf-fail", &["analyst"]))
            .await
            .unwrap();

        let error = wait_for_event(&mut h.events, "wf-fail", "workflow.error").await;
        let WorkflowEvent::Error {
            step_index,
            agent,
            reason,
            ..
        } = error
        else {
            panic!("expected error event");
        };
        assert_eq!(step_index, Some(0));
        assert_eq!(agent, Some(AgentPersona::Analyst));
        assert_eq!(reason, ErrorReason::InvocationFailed);

        let workflow = h.orchestrator.get_workflow("wf-fail").await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Processing);
        let step = h.store.get_step("wf-fail", 0).await.unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Processing);
        assert!(step.error.is_some());
        assert!(h.store.get_result("wf-fail", 0).await.unwrap().is_none());
        assert_eq!(h.orchestrator.in_flight_step("wf-fail"), None);

        h.orchestrator.retry_step("wf-fail", 0).await.unwrap();
        wait_for_event(&mut h.events, "wf-fail", "workflow.completed").await;

        let step = h.store.get_step("wf-fail", 0).await.unwrap().unwrap();
        assert_eq!(step.attempt, 2);
        assert_eq!(invoker.calls().len(), 2);
    }

    #[tokio::test]
    async fn external_result_clears_error_of_failed_invocation() {
        let mut h = harness(ScriptedInvoker::failing_on(&[0]), None);
        h.orchestrator
            .start_workflow(request("wf-recover", &["analyst"]))
            .await
            .unwrap();
        wait_for_event(&mut h.events, "wf-recover", "workflow.error").await;
        let step = h.store.get_step("wf-recover", 0).await.unwrap().unwrap();
        assert!(step.error.is_some());

        let done = h
            .orchestrator
            .advance_workflow("wf-recover", 0, json!({"response": "Hold"}))
            .await
            .unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);

        let step = h.store.get_step("wf-recover", 0).await.unwrap().unwrap();
        assert_eq!(step.error, None);
        assert_eq!(step.failed_at, None);
    }

    #[tokio::test]
    async fn retry_is_refused_while_step_is_running() {
        let h = harness(ScriptedInvoker::hanging_on(&[0]), None);
        h.orchestrator
            .start_workflow(request("wf-busy", &["analyst", "trader"]))
            .await
            .unwrap();

        let err = h.orchestrator.retry_step("wf-busy", 0).await.unwrap_err();
        assert!(matches!(err, WorkflowError::StepNotStuck { index: 0, .. }));
        let err = h.orchestrator.retry_step("wf-busy", 5).await.unwrap_err();
        assert!(matches!(err, WorkflowError::OutOfOrder { index: 5, .. }));
    }

    #[tokio::test]
    async fn step_deadline_fails_step_and_workflow() {
        let mut h = harness(
            ScriptedInvoker::hanging_on(&[0]),
            Some(Duration::from_millis(50)),
        );
        h.orchestrator
            .start_workflow(request("wf-slow", &["analyst", "trader"]))
            .await
            .unwrap();

        let error = wait_for_event(&mut h.events, "wf-slow", "workflow.error").await;
        assert!(matches!(
            error,
            WorkflowEvent::Error {
                reason: ErrorReason::Timeout,
                step_index: Some(0),
                ..
            }
        ));

        let workflow = h.orchestrator.get_workflow("wf-slow").await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Failed);
        let step = h.store.get_step("wf-slow", 0).await.unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert!(step.failed_at.is_some());
        assert!(h.store.get_step("wf-slow", 1).await.unwrap().is_none());
    }

    /// A workflow persisted with its first step dispatched but no invocation
    /// running, as after a crash or restart.
    async fn seed_orphan(
        h: &crate::test_support::Harness,
        id: &str,
        age: chrono::Duration,
    ) -> WorkflowRecord {
        let mut record = sample_record(id, 2);
        record.started_at -= age;
        let mut step = sample_step(&record, 0);
        step.started_at -= age;
        h.store.create_workflow(&record, Some(&step)).await.unwrap();
        record
    }

    #[tokio::test]
    async fn sweep_fails_orphaned_steps_past_their_deadline() {
        let invoker = ScriptedInvoker::resolving();
        let mut h = harness(invoker.clone(), Some(Duration::from_secs(5)));
        seed_orphan(&h, "wf-orphan", chrono::Duration::seconds(10)).await;
        seed_orphan(&h, "wf-fresh", chrono::Duration::zero()).await;

        assert_eq!(h.orchestrator.sweep_deadlines().await.unwrap(), 1);

        let error = wait_for_event(&mut h.events, "wf-orphan", "workflow.error").await;
        assert!(matches!(
            error,
            WorkflowEvent::Error {
                reason: ErrorReason::Timeout,
                step_index: Some(0),
                ..
            }
        ));
        let workflow = h.orchestrator.get_workflow("wf-orphan").await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Failed);
        let step = h.store.get_step("wf-orphan", 0).await.unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert!(step.failed_at.is_some());

        let fresh = h.orchestrator.get_workflow("wf-fresh").await.unwrap();
        assert_eq!(fresh.status, WorkflowStatus::Processing);
        assert!(invoker.calls().is_empty());

        // Nothing left to expire
        assert_eq!(h.orchestrator.sweep_deadlines().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sweep_skips_steps_with_a_running_invocation() {
        let h = harness(ScriptedInvoker::hanging_on(&[0]), Some(Duration::from_secs(5)));
        seed_orphan(&h, "wf-resumed", chrono::Duration::seconds(10)).await;

        // An operator re-dispatched the step; it keeps its original start time
        h.orchestrator.retry_step("wf-resumed", 0).await.unwrap();
        assert_eq!(h.orchestrator.in_flight_step("wf-resumed"), Some(0));

        assert_eq!(h.orchestrator.sweep_deadlines().await.unwrap(), 0);
        let workflow = h.orchestrator.get_workflow("wf-resumed").await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Processing);
    }

    #[tokio::test]
    async fn background_sweep_expires_orphans_found_at_startup() {
        let mut h = harness(
            ScriptedInvoker::resolving(),
            Some(Duration::from_millis(50)),
        );
        seed_orphan(&h, "wf-restarted", chrono::Duration::zero()).await;

        let sweeper = h.orchestrator.spawn_deadline_sweep(Duration::from_millis(20));
        wait_for_event(&mut h.events, "wf-restarted", "workflow.error").await;
        sweeper.abort();

        let workflow = h.orchestrator.get_workflow("wf-restarted").await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Failed);
        assert!(workflow.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn sweep_is_a_no_op_without_a_deadline() {
        let h = harness(ScriptedInvoker::resolving(), None);
        seed_orphan(&h, "wf-patient", chrono::Duration::days(1)).await;

        assert_eq!(h.orchestrator.sweep_deadlines().await.unwrap(), 0);
    }

    #[test]
    fn sweep_period_follows_the_step_deadline() {
        let period = |timeout| OrchestratorConfig { step_timeout: timeout }.sweep_period();
        assert_eq!(period(None), None);
        assert_eq!(period(Some(Duration::from_secs(5))), Some(Duration::from_secs(5)));
        assert_eq!(period(Some(Duration::from_millis(10))), Some(MIN_SWEEP_PERIOD));
        assert_eq!(period(Some(Duration::from_secs(300))), Some(MAX_SWEEP_PERIOD));
    }

    #[tokio::test]
    async fn cancel_keeps_persisted_results_and_is_idempotent() {
        let mut h = harness(ScriptedInvoker::hanging_on(&[0, 1]), None);
        h.orchestrator
            .start_workflow(request("wf-cancel", &["analyst", "trader"]))
            .await
            .unwrap();
        h.orchestrator
            .advance_workflow("wf-cancel", 0, json!({"response": "ok"}))
            .await
            .unwrap();
        drain(&mut h.events);

        let cancelled = h.orchestrator.cancel_workflow("wf-cancel").await.unwrap();
        assert_eq!(cancelled.status, WorkflowStatus::Cancelled);
        assert_eq!(h.orchestrator.in_flight_step("wf-cancel"), None);
        assert!(h.store.get_result("wf-cancel", 0).await.unwrap().is_some());

        let error = wait_for_event(&mut h.events, "wf-cancel", "workflow.error").await;
        assert!(matches!(
            error,
            WorkflowEvent::Error {
                reason: ErrorReason::Cancelled,
                step_index: Some(1),
                ..
            }
        ));

        let again = h.orchestrator.cancel_workflow("wf-cancel").await.unwrap();
        assert_eq!(again, cancelled);

        let err = h
            .orchestrator
            .advance_workflow("wf-cancel", 1, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::Terminal {
                status: WorkflowStatus::Cancelled,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn operator_can_fail_a_stuck_workflow() {
        let mut h = harness(ScriptedInvoker::failing_on(&[0]), None);
        h.orchestrator
            .start_workflow(request("wf-stuck", &["analyst"]))
            .await
            .unwrap();
        wait_for_event(&mut h.events, "wf-stuck", "workflow.error").await;

        let failed = h
            .orchestrator
            .fail_workflow("wf-stuck", "analyst backend down")
            .await
            .unwrap();
        assert_eq!(failed.status, WorkflowStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("analyst backend down"));

        let step = h.store.get_step("wf-stuck", 0).await.unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Failed);

        let error = wait_for_event(&mut h.events, "wf-stuck", "workflow.error").await;
        assert!(matches!(
            error,
            WorkflowEvent::Error {
                reason: ErrorReason::OperatorFailed,
                ..
            }
        ));

        let err = h
            .orchestrator
            .fail_workflow("wf-stuck", "again")
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Terminal { .. }));
    }

    #[tokio::test]
    async fn workflows_run_concurrently() {
        let mut h = harness(ScriptedInvoker::resolving(), None);
        let starts = (0..5).map(|i| {
            let orchestrator = h.orchestrator.clone();
            async move {
                orchestrator
                    .start_workflow(request(&format!("wf-par-{i}"), &["analyst", "general"]))
                    .await
            }
        });
        for started in futures::future::join_all(starts).await {
            tokio_test::assert_ok!(started);
        }

        let mut completed = std::collections::HashSet::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while completed.len() < 5 {
                let routed = h.events.recv().await.unwrap();
                if routed.event.name() == "workflow.completed" {
                    completed.insert(routed.event.workflow_id().to_string());
                }
            }
        })
        .await
        .expect("all workflows should complete");

        let listed = h.orchestrator.list_workflows(10).await.unwrap();
        assert_eq!(listed.len(), 5);
        assert!(listed.iter().all(|w| w.status == WorkflowStatus::Completed));
    }
}
