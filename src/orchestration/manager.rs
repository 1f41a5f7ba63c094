//! Orchestration manager.
//!
//! The [`Orchestrator`] owns the dependency graph and one state machine per
//! task, and drives a session from the first ready task to quiescence:
//!
//! 1. A scheduling tick computes `ready(settled)` (settled = completed plus
//!    non-critical failures), claims every ready task that has no claim yet
//!    and moves it to `Queued`.
//! 2. Each claimed attempt waits for a worker permit, dispatches its command
//!    and verifies the result.
//! 3. Failed attempts are re-queued after their backoff delay (without
//!    holding a permit) or marked `Failed`, blocking dependents when the task
//!    is critical.
//!
//! All session state lives behind one mutex, so claiming a ready task is
//! atomic with computing the ready set. Dispatch is the only operation that
//! awaits.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::core::{DependencyGraph, Task, TaskId};
use crate::dispatch::{
    DispatchResult, Dispatcher, ExecutorRegistry, RemediationAction, RemediationHint,
};
use crate::error::{Error, Result};
use crate::events::{EventBus, EventStream, ProgressEvent, DEFAULT_CAPACITY};
use crate::execution::{
    AttemptFailure, AttemptOutcome, ExecutionSnapshot, SessionId, TaskState, TaskStateMachine,
};
use crate::orchestration::advisor::Advisor;
use crate::orchestration::report::{SessionRecord, SessionReport, TaskRecord};
use crate::verification::VerificationEngine;

/// Default number of tasks dispatched at once.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default interval between scheduling ticks when nothing wakes the loop.
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 250;

/// Default interval between progress events for a running attempt.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;

/// Runtime settings for a session.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum concurrently dispatched tasks.
    pub concurrency: usize,
    /// Capacity of the progress event channel.
    pub event_capacity: usize,
    pub tick_interval: Duration,
    /// How often a running attempt republishes its progress.
    pub heartbeat_interval: Duration,
    /// Re-run a failed task once when the advisor suggests a retry.
    pub auto_remediate: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            event_capacity: DEFAULT_CAPACITY,
            tick_interval: Duration::from_millis(DEFAULT_TICK_INTERVAL_MS),
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            auto_remediate: false,
        }
    }
}

impl From<&Config> for OrchestratorConfig {
    fn from(config: &Config) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            event_capacity: config.event_capacity.max(1),
            tick_interval: Duration::from_millis(config.tick_interval_ms.max(1)),
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms.max(1)),
            auto_remediate: config.auto_remediate,
        }
    }
}

/// Builds an [`Orchestrator`] from a task list.
pub struct OrchestratorBuilder {
    tasks: Vec<Task>,
    registry: ExecutorRegistry,
    config: OrchestratorConfig,
    advisor: Option<Arc<dyn Advisor>>,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn advisor(mut self, advisor: Arc<dyn Advisor>) -> Self {
        self.advisor = Some(advisor);
        self
    }

    /// Validate the graph and create the session.
    ///
    /// # Errors
    /// `DuplicateTask`, `UnknownPrerequisite` or `CycleDetected` when the
    /// tasks do not form a valid graph.
    pub fn build(self) -> Result<Orchestrator> {
        let graph = DependencyGraph::build(self.tasks)?;
        let tasks = graph
            .tasks()
            .map(|t| (t.id().clone(), Arc::new(t.clone())))
            .collect();
        let concurrency = self.config.concurrency.max(1);

        let inner = Inner {
            session_id: SessionId::new(),
            graph,
            tasks,
            state: Mutex::new(SessionState::new()),
            dispatcher: Dispatcher::new(self.registry),
            bus: EventBus::with_capacity(self.config.event_capacity),
            pool: Arc::new(Semaphore::new(concurrency)),
            root: CancellationToken::new(),
            notify: Notify::new(),
            advisor: self.advisor,
            config: self.config,
        };
        debug!(session = %inner.session_id.short(), tasks = inner.graph.len(), "session created");
        Ok(Orchestrator {
            inner: Arc::new(inner),
        })
    }
}

/// Mutable session state, guarded by one mutex.
struct SessionState {
    machines: HashMap<TaskId, TaskStateMachine>,
    /// Completed plus non-critical failures: what readiness is computed from.
    settled: HashSet<TaskId>,
    /// Dependent -> failed critical task holding it back.
    blocked: HashMap<TaskId, TaskId>,
    /// Cancellation token per claimed task.
    tokens: HashMap<TaskId, CancellationToken>,
    /// Claimed tasks that are not terminal yet.
    in_flight: usize,
    /// Advisor calls still outstanding.
    advising: usize,
    /// Tasks already re-run on an advisor's suggestion.
    remediated: HashSet<TaskId>,
    running: bool,
    closed: bool,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            machines: HashMap::new(),
            settled: HashSet::new(),
            blocked: HashMap::new(),
            tokens: HashMap::new(),
            in_flight: 0,
            advising: 0,
            remediated: HashSet::new(),
            running: false,
            closed: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    fn is_idle(&self) -> bool {
        self.in_flight == 0 && self.advising == 0
    }
}

struct Inner {
    session_id: SessionId,
    graph: DependencyGraph,
    tasks: HashMap<TaskId, Arc<Task>>,
    state: Mutex<SessionState>,
    dispatcher: Dispatcher,
    bus: EventBus,
    /// Worker permits, sized by `concurrency`.
    pool: Arc<Semaphore>,
    /// Parent of every attempt's cancellation token.
    root: CancellationToken,
    /// Wakes the scheduling loop when an attempt settles.
    notify: Notify,
    advisor: Option<Arc<dyn Advisor>>,
    config: OrchestratorConfig,
}

/// Handle to one orchestration session. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn builder(tasks: Vec<Task>, registry: ExecutorRegistry) -> OrchestratorBuilder {
        OrchestratorBuilder {
            tasks,
            registry,
            config: OrchestratorConfig::default(),
            advisor: None,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.inner.session_id
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.inner.graph
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Subscribe to progress events from this point onward.
    ///
    /// The stream ends when the session finishes.
    pub fn subscribe(&self) -> EventStream {
        self.inner.bus.subscribe()
    }

    /// Drive the session until no task can make further progress.
    ///
    /// Closes the event bus and returns the final report.
    ///
    /// # Errors
    /// `SessionClosed` if the session already finished; `Validation` if
    /// another `run` is in progress.
    pub async fn run(&self) -> Result<SessionReport> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(Error::SessionClosed);
            }
            if state.running {
                return Err(Error::Validation("session is already running".into()));
            }
            state.running = true;
            state.started_at = Utc::now();
        }
        info!(
            session = %self.inner.session_id.short(),
            tasks = self.inner.graph.len(),
            concurrency = self.inner.config.concurrency,
            "session started"
        );

        loop {
            if self.tick() {
                break;
            }
            tokio::select! {
                _ = self.inner.notify.notified() => {}
                _ = tokio::time::sleep(self.inner.config.tick_interval) => {}
            }
        }

        let report = self.close();
        info!(session = %self.inner.session_id.short(), summary = %report.summary(), "session finished");
        Ok(report)
    }

    /// Current snapshot of one task.
    pub fn status(&self, task_id: &TaskId) -> Result<ExecutionSnapshot> {
        let task = self
            .inner
            .tasks
            .get(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;
        let state = self.lock();
        Ok(Self::snapshot_of(&state, task))
    }

    /// Snapshots of every task in declaration order.
    pub fn snapshot_all(&self) -> Vec<ExecutionSnapshot> {
        let state = self.lock();
        self.inner
            .graph
            .tasks()
            .map(|task| Self::snapshot_of(&state, task))
            .collect()
    }

    /// Cancel a task and every not-yet-started transitive dependent.
    ///
    /// A running dispatch is cancelled through its token; the task is marked
    /// `Cancelled` immediately. Returns the cancelled task ids, the target
    /// first.
    ///
    /// # Errors
    /// `TaskNotFound`, `SessionClosed`, or `InvalidTransition` when the task
    /// is already terminal.
    pub fn cancel(&self, task_id: &TaskId) -> Result<Vec<TaskId>> {
        if !self.inner.tasks.contains_key(task_id) {
            return Err(Error::TaskNotFound(task_id.clone()));
        }
        let cancelled = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if state.closed {
                return Err(Error::SessionClosed);
            }
            self.cancel_one(state, task_id)?;

            let mut cancelled = vec![task_id.clone()];
            for dependent in self.inner.graph.transitive_dependents(task_id) {
                let id = dependent.id();
                let not_started = state
                    .machines
                    .get(id)
                    .map(|m| m.state() == TaskState::Pending)
                    .unwrap_or(true);
                if not_started && self.cancel_one(state, id).is_ok() {
                    cancelled.push(id.clone());
                }
            }
            cancelled
        };
        info!(task = %task_id, cancelled = cancelled.len(), "cancelled task and dependents");
        self.inner.notify.notify_one();
        Ok(cancelled)
    }

    /// Re-run a failed task with a fresh attempt budget.
    ///
    /// `overrides` are merged over the task parameters. Dependents blocked
    /// by this task are released.
    ///
    /// # Errors
    /// `TaskNotFound`, `SessionClosed`, or `InvalidTransition` unless the
    /// task is `Failed`.
    pub fn rerun(
        &self,
        task_id: &TaskId,
        overrides: BTreeMap<String, serde_json::Value>,
    ) -> Result<()> {
        if !self.inner.tasks.contains_key(task_id) {
            return Err(Error::TaskNotFound(task_id.clone()));
        }
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            if state.closed {
                return Err(Error::SessionClosed);
            }
            self.reset_task(state, task_id, overrides)?;
        }
        info!(task = %task_id, "manual re-run requested");
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Cancel every task that has not reached a terminal state and stop
    /// scheduling. Returns the cancelled task ids.
    pub fn shutdown(&self) -> Vec<TaskId> {
        let cancelled = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if state.closed {
                return Vec::new();
            }
            let mut cancelled = Vec::new();
            for task in self.inner.graph.tasks() {
                let id = task.id();
                let live = state
                    .machines
                    .get(id)
                    .map(|m| !m.state().is_terminal())
                    .unwrap_or(true);
                if live && self.cancel_one(state, id).is_ok() {
                    cancelled.push(id.clone());
                }
            }
            cancelled
        };
        self.inner.root.cancel();
        warn!(cancelled = cancelled.len(), "session shut down");
        self.inner.notify.notify_one();
        cancelled
    }

    /// Report for the session so far.
    pub fn report(&self) -> SessionReport {
        let state = self.lock();
        let snapshots: Vec<ExecutionSnapshot> = self
            .inner
            .graph
            .tasks()
            .map(|task| Self::snapshot_of(&state, task))
            .collect();
        SessionReport::from_snapshots(
            self.inner.session_id,
            state.started_at,
            state.finished_at,
            &snapshots,
        )
    }

    /// Durable record of the session: report plus per-task history.
    pub fn record(&self) -> SessionRecord {
        let report = self.report();
        let state = self.lock();
        let tasks = self
            .inner
            .graph
            .tasks()
            .map(|task| {
                let machine = state.machines.get(task.id());
                TaskRecord {
                    task: task.clone(),
                    snapshot: Self::snapshot_of(&state, task),
                    history: machine.map(|m| m.history().to_vec()).unwrap_or_default(),
                    transitions: machine
                        .map(|m| m.transitions().to_vec())
                        .unwrap_or_default(),
                }
            })
            .collect();
        SessionRecord {
            session_id: self.inner.session_id,
            report,
            tasks,
            metadata: BTreeMap::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot_of(state: &SessionState, task: &Task) -> ExecutionSnapshot {
        let blocked_by = state.blocked.get(task.id()).cloned();
        match state.machines.get(task.id()) {
            Some(machine) => ExecutionSnapshot {
                blocked_by,
                ..machine.snapshot()
            },
            None => ExecutionSnapshot::pending(task, blocked_by),
        }
    }

    /// One scheduling pass. Returns true once the session is idle.
    fn tick(&self) -> bool {
        let (claims, idle) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let mut claims = Vec::new();

            if !state.closed && !self.inner.root.is_cancelled() {
                let ready: Vec<TaskId> = self
                    .inner
                    .graph
                    .ready(&state.settled)
                    .into_iter()
                    .map(|t| t.id().clone())
                    .collect();

                for id in ready {
                    if state.blocked.contains_key(&id) {
                        continue;
                    }
                    let Some(task) = self.inner.tasks.get(&id) else {
                        continue;
                    };
                    let machine = state
                        .machines
                        .entry(id.clone())
                        .or_insert_with(|| TaskStateMachine::new(Arc::clone(task)));
                    if machine.state() != TaskState::Pending {
                        continue;
                    }
                    match machine.queue(self.inner.session_id) {
                        Ok(event) => {
                            self.inner.bus.publish(event);
                        }
                        Err(e) => {
                            error!(task = %id, error = %e, "failed to queue task");
                            continue;
                        }
                    }
                    let token = self.inner.root.child_token();
                    state.tokens.insert(id.clone(), token.clone());
                    state.in_flight += 1;
                    claims.push((id, token));
                }
            }
            (claims, state.is_idle())
        };

        for (id, token) in claims {
            debug!(task = %id, "claimed task");
            self.spawn_attempt(id, token);
        }
        idle
    }

    fn close(&self) -> SessionReport {
        {
            let mut state = self.lock();
            state.closed = true;
            state.running = false;
            state.finished_at = Some(Utc::now());
        }
        self.inner.root.cancel();
        let report = self.report();
        self.inner.bus.close();
        report
    }

    fn spawn_attempt(&self, id: TaskId, token: CancellationToken) {
        let this = self.clone();
        tokio::spawn(async move {
            this.attempt(&id, token).await;
            this.inner.notify.notify_one();
        });
    }

    /// Run one attempt: wait for a permit, dispatch, settle the outcome.
    async fn attempt(&self, id: &TaskId, token: CancellationToken) {
        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            permit = Arc::clone(&self.inner.pool).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        let command = {
            let mut state = self.lock();
            let Some(machine) = state.machines.get_mut(id) else {
                return;
            };
            match machine.start() {
                Ok((command, event)) => {
                    self.inner.bus.publish(event);
                    command
                }
                Err(e) => {
                    debug!(task = %id, error = %e, "attempt not started");
                    return;
                }
            }
        };

        let result = {
            let dispatch = self.inner.dispatcher.dispatch(command, &token, |msg| {
                let mut state = self.lock();
                if let Some(event) = state.machines.get_mut(id).and_then(|m| m.progress(&msg)) {
                    self.inner.bus.publish(event);
                }
            });
            tokio::pin!(dispatch);

            let period = self.inner.config.heartbeat_interval;
            let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let result = loop {
                tokio::select! {
                    result = &mut dispatch => break result,
                    _ = heartbeat.tick() => {
                        let mut state = self.lock();
                        if let Some(event) = state.machines.get_mut(id).and_then(|m| m.heartbeat()) {
                            self.inner.bus.publish(event);
                        }
                    }
                }
            };
            result
        };
        drop(permit);

        self.settle(id, token, result);
    }

    /// Apply an attempt's result to the task's state machine.
    fn settle(&self, id: &TaskId, token: CancellationToken, result: Result<DispatchResult>) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(machine) = state.machines.get_mut(id) else {
            return;
        };
        if machine.state() == TaskState::Cancelled {
            return;
        }

        let outcome = match result {
            Err(Error::Cancelled) => {
                // Token fired without cancel() recording it (root shutdown).
                if let Ok(event) = machine.cancel() {
                    self.inner.bus.publish(event);
                    state.in_flight = state.in_flight.saturating_sub(1);
                    state.tokens.remove(id);
                }
                return;
            }
            Err(err) => {
                warn!(task = %id, error = %err, "dispatch failed");
                machine.fail(AttemptFailure::from_error(&err))
            }
            Ok(result) if !result.success => machine.reject(&result),
            Ok(result) => self.verify(machine, &result),
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(task = %id, error = %e, "transition rejected");
                return;
            }
        };
        self.inner.bus.publish(outcome.event().clone());

        match outcome {
            AttemptOutcome::Complete(_) => {
                info!(task = %id, "task complete");
                state.in_flight = state.in_flight.saturating_sub(1);
                state.tokens.remove(id);
                state.settled.insert(id.clone());
            }
            AttemptOutcome::Retry { delay, .. } => {
                debug!(task = %id, ?delay, "scheduling retry");
                self.schedule_requeue(id.clone(), token, delay);
            }
            AttemptOutcome::Failed(_) => {
                state.in_flight = state.in_flight.saturating_sub(1);
                state.tokens.remove(id);
                self.on_failed(state, id);
            }
        }
    }

    fn verify(
        &self,
        machine: &mut TaskStateMachine,
        result: &DispatchResult,
    ) -> Result<AttemptOutcome> {
        let event = machine.begin_verification(result)?;
        self.inner.bus.publish(event);
        let output = machine
            .current()
            .map(|e| e.output.clone())
            .unwrap_or_default();
        let report =
            VerificationEngine::verify(&output, &result.probes, machine.task().verification());
        machine.finish_verification(report)
    }

    fn schedule_requeue(&self, id: TaskId, token: CancellationToken, delay: Duration) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            this.requeue(&id, token);
        });
    }

    fn requeue(&self, id: &TaskId, token: CancellationToken) {
        {
            let mut state = self.lock();
            if token.is_cancelled() {
                return;
            }
            let Some(machine) = state.machines.get_mut(id) else {
                return;
            };
            match machine.queue(self.inner.session_id) {
                Ok(event) => {
                    self.inner.bus.publish(event);
                }
                Err(e) => {
                    debug!(task = %id, error = %e, "retry not queued");
                    return;
                }
            }
        }
        self.spawn_attempt(id.clone(), token);
    }

    /// Bookkeeping for a task that just reached `Failed`.
    fn on_failed(&self, state: &mut SessionState, id: &TaskId) {
        let Some(machine) = state.machines.get(id) else {
            return;
        };
        let critical = machine.task().is_critical();
        let detail = machine.failure().cloned();
        warn!(
            task = %id,
            critical,
            attempts = machine.attempts(),
            reason = detail.as_ref().map(|d| d.message.as_str()).unwrap_or(""),
            "task failed"
        );

        if critical {
            self.block_dependents(state, id);
        } else {
            state.settled.insert(id.clone());
        }

        let (Some(advisor), Some(detail), Some(task)) = (
            self.inner.advisor.clone(),
            detail,
            self.inner.tasks.get(id).cloned(),
        ) else {
            return;
        };
        state.advising += 1;
        let this = self.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let hint = advisor.advise(&task, &detail).await;
            this.apply_advice(&id, hint);
            this.inner.notify.notify_one();
        });
    }

    /// Attach an advisor's hint and, when enabled, act on a retry suggestion.
    ///
    /// A hint supplied by the executor takes precedence over the advisor's.
    fn apply_advice(&self, id: &TaskId, hint: Option<RemediationHint>) {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.advising = state.advising.saturating_sub(1);

        let Some(hint) = hint else {
            return;
        };
        let Some(machine) = state.machines.get_mut(id) else {
            return;
        };
        if machine.state() != TaskState::Failed {
            return;
        }
        let hint = match machine.failure().and_then(|f| f.remediation.clone()) {
            Some(existing) => existing,
            None => {
                machine.attach_remediation(hint.clone());
                hint
            }
        };
        debug!(task = %id, reason = %hint.reason, "remediation hint attached");

        if !self.inner.config.auto_remediate || state.closed {
            return;
        }
        let RemediationAction::Retry { params } = hint.action else {
            return;
        };
        if !state.remediated.insert(id.clone()) {
            return;
        }
        info!(task = %id, reason = %hint.reason, "auto-remediating failed task");
        if let Err(e) = self.reset_task(state, id, params) {
            warn!(task = %id, error = %e, "auto-remediation failed");
        }
    }

    /// `Failed` -> `Pending` with overrides; releases blocked dependents.
    fn reset_task(
        &self,
        state: &mut SessionState,
        id: &TaskId,
        overrides: BTreeMap<String, serde_json::Value>,
    ) -> Result<()> {
        let machine = state
            .machines
            .get_mut(id)
            .ok_or_else(|| Error::InvalidTransition {
                from: TaskState::Pending.to_string(),
                to: TaskState::Pending.to_string(),
            })?;
        let event = machine.reset_for_rerun(overrides)?;
        self.inner.bus.publish(event);
        state.settled.remove(id);

        state.blocked.retain(|_, blocker| *blocker != *id);
        let still_failed: Vec<TaskId> = state
            .machines
            .values()
            .filter(|m| m.state() == TaskState::Failed && m.task().is_critical())
            .map(|m| m.task_id().clone())
            .collect();
        for failed in still_failed {
            self.block_dependents(state, &failed);
        }
        Ok(())
    }

    /// Hold back every not-yet-started transitive dependent of a failed
    /// critical task, announcing each one once.
    fn block_dependents(&self, state: &mut SessionState, failed: &TaskId) {
        for dependent in self.inner.graph.transitive_dependents(failed) {
            let id = dependent.id();
            let started = state
                .machines
                .get(id)
                .map(|m| m.state() != TaskState::Pending)
                .unwrap_or(false);
            if started || state.blocked.contains_key(id) {
                continue;
            }
            debug!(task = %id, blocker = %failed, "task blocked");
            state.blocked.insert(id.clone(), failed.clone());
            self.inner
                .bus
                .publish(ProgressEvent::blocked(id.clone(), failed.clone()));
        }
    }

    /// Mark one task `Cancelled`, firing its token if it was claimed.
    fn cancel_one(&self, state: &mut SessionState, id: &TaskId) -> Result<()> {
        let task = self
            .inner
            .tasks
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        let machine = state
            .machines
            .entry(id.clone())
            .or_insert_with(|| TaskStateMachine::new(Arc::clone(task)));
        let claimed = machine.state() != TaskState::Pending;
        let event = machine.cancel()?;
        self.inner.bus.publish(event);

        if claimed {
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        if let Some(token) = state.tokens.remove(id) {
            token.cancel();
        }
        state.blocked.remove(id);
        Ok(())
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("session_id", &self.inner.session_id)
            .field("tasks", &self.inner.graph.len())
            .field("config", &self.inner.config)
            .finish()
    }
}
