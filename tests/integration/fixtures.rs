//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scripted executor with per-action behaviour
//! - Building orchestrators with fast scheduling ticks
//! - Inspecting collected progress events

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use provisor::core::{ExecutorKind, RetryPolicy, Task, TaskId};
use provisor::dispatch::{
    CommandMode, DispatchCommand, DispatchResult, ExecutionId, Executor, ExecutorRegistry, ProgressSink,
    RemediationHint,
};
use provisor::events::{EventStream, ProgressEvent};
use provisor::execution::TaskState;
use provisor::orchestration::{Advisor, Orchestrator, OrchestratorConfig};
use provisor::Result;

/// What the scripted executor does for one action.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Report progress and succeed.
    Succeed,
    /// Fail every attempt with the given output.
    Fail(&'static str),
    /// Fail the first `n` calls, then succeed.
    FailTimes(usize),
    /// Never answer; only a timeout or cancellation ends the call.
    Hang,
    /// Sleep, then succeed.
    Sleep(Duration),
    /// Succeed, returning probe output keyed by verification step name.
    Probes(Vec<(&'static str, &'static str)>),
    /// Fail with a remediation hint of the executor's own.
    FailWithHint(RemediationHint),
    /// Succeed only when the command carries the named parameter.
    RequireParam(&'static str),
    /// The dispatch channel itself breaks.
    ChannelError,
}

/// One call seen by the scripted executor.
#[derive(Debug, Clone)]
pub struct Call {
    pub action: String,
    pub attempt: u32,
    pub params: BTreeMap<String, serde_json::Value>,
    pub mode: CommandMode,
}

/// Executor whose behaviour is scripted per action.
///
/// Actions without a script succeed.
pub struct ScriptedExecutor {
    kind: ExecutorKind,
    behaviors: Mutex<HashMap<String, Behavior>>,
    calls: Mutex<Vec<Call>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    cancels: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::for_kind(ExecutorKind::Shell)
    }

    pub fn for_kind(kind: ExecutorKind) -> Self {
        Self {
            kind,
            behaviors: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
        }
    }

    pub fn behave(self, action: &str, behavior: Behavior) -> Self {
        self.behaviors
            .lock()
            .unwrap()
            .insert(action.to_string(), behavior);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Actions in the order they were dispatched.
    pub fn actions(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.action).collect()
    }

    pub fn calls_for(&self, action: &str) -> usize {
        self.calls().iter().filter(|c| c.action == action).count()
    }

    /// Highest number of calls that were in flight at the same time.
    pub fn max_concurrent(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    /// Best-effort cancels received.
    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    fn behavior(&self, action: &str) -> Behavior {
        self.behaviors
            .lock()
            .unwrap()
            .get(action)
            .cloned()
            .unwrap_or(Behavior::Succeed)
    }
}

/// Decrements the running counter even when the call is dropped mid-flight.
struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    fn kind(&self) -> ExecutorKind {
        self.kind
    }

    async fn execute(
        &self,
        command: DispatchCommand,
        mut progress: ProgressSink,
    ) -> Result<DispatchResult> {
        let call_number = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Call {
                action: command.action.clone(),
                attempt: command.attempt,
                params: command.params.clone(),
                mode: command.mode,
            });
            calls.iter().filter(|c| c.action == command.action).count()
        };
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        let _guard = RunningGuard(&self.running);

        let id = command.execution_id;
        progress.report(10, "starting");
        let behavior = match (command.mode, self.behavior(&command.action)) {
            // Checks never run the action, so action-only scripts do not apply.
            (CommandMode::Check, Behavior::FailTimes(_))
            | (CommandMode::Check, Behavior::RequireParam(_))
            | (CommandMode::Check, Behavior::FailWithHint(_)) => Behavior::Succeed,
            (_, behavior) => behavior,
        };
        let result = match behavior {
            Behavior::Succeed => DispatchResult::success(id, format!("ok {}", command.action)),
            Behavior::Fail(output) => DispatchResult::failure(id, output),
            Behavior::FailTimes(n) if call_number <= n => {
                DispatchResult::failure(id, format!("failure {} of {}", call_number, n))
            }
            Behavior::FailTimes(_) => DispatchResult::success(id, "recovered"),
            Behavior::Hang => std::future::pending::<DispatchResult>().await,
            Behavior::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                DispatchResult::success(id, "slept")
            }
            Behavior::Probes(probes) => probes
                .into_iter()
                .fold(DispatchResult::success(id, "probed"), |result, (step, out)| {
                    result.with_probe(step, out)
                }),
            Behavior::FailWithHint(hint) => {
                DispatchResult::failure(id, "connection reset by peer").with_remediation(hint)
            }
            Behavior::RequireParam(key) if command.params.contains_key(key) => {
                DispatchResult::success(id, format!("used {}", key))
            }
            Behavior::RequireParam(key) => {
                DispatchResult::failure(id, format!("connection reset while missing {}", key))
            }
            Behavior::ChannelError => {
                return Err(provisor::Error::ExecutorFailure("channel closed".into()))
            }
        };
        progress.report(50, "working");
        Ok(result)
    }

    async fn cancel(&self, _execution_id: ExecutionId) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

/// Advisor returning the same hint for every failure.
pub struct FixedAdvisor(pub RemediationHint);

#[async_trait]
impl Advisor for FixedAdvisor {
    async fn advise(
        &self,
        _task: &Task,
        _failure: &provisor::execution::FailureDetail,
    ) -> Option<RemediationHint> {
        Some(self.0.clone())
    }
}

/// A shell task whose action is its id, attempted once.
pub fn task(id: &str) -> Task {
    Task::new(id, ExecutorKind::Shell, id).with_retry(RetryPolicy::none())
}

pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        tick_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

pub fn registry(executor: &Arc<ScriptedExecutor>) -> ExecutorRegistry {
    let executor: Arc<dyn Executor> = executor.clone();
    ExecutorRegistry::new().with(executor).unwrap()
}

pub fn orchestrator(tasks: Vec<Task>, executor: &Arc<ScriptedExecutor>) -> Orchestrator {
    orchestrator_with(tasks, executor, fast_config(), None)
}

pub fn orchestrator_with(
    tasks: Vec<Task>,
    executor: &Arc<ScriptedExecutor>,
    config: OrchestratorConfig,
    advisor: Option<Arc<dyn Advisor>>,
) -> Orchestrator {
    let mut builder = Orchestrator::builder(tasks, registry(executor)).config(config);
    if let Some(advisor) = advisor {
        builder = builder.advisor(advisor);
    }
    builder.build().unwrap()
}

pub async fn collect(stream: EventStream) -> Vec<ProgressEvent> {
    stream.collect().await
}

/// States published for one task, with consecutive repeats collapsed.
pub fn states_for(events: &[ProgressEvent], id: &str) -> Vec<TaskState> {
    let mut states: Vec<TaskState> = Vec::new();
    for event in events.iter().filter(|e| e.task_id.as_str() == id) {
        if states.last() != Some(&event.state) {
            states.push(event.state);
        }
    }
    states
}

/// Index of the first event for `id` in `state`.
pub fn position(events: &[ProgressEvent], id: &str, state: TaskState) -> Option<usize> {
    events
        .iter()
        .position(|e| e.task_id.as_str() == id && e.state == state && !e.is_blocked())
}

/// Wait until an event for `id` in `state` arrives on the stream.
pub async fn wait_for(stream: &mut EventStream, id: &str, state: TaskState) -> ProgressEvent {
    let wait = async {
        while let Some(event) = stream.next().await {
            if event.task_id.as_str() == id && event.state == state {
                return event;
            }
        }
        panic!("stream ended before {} reached {}", id, state);
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("timed out waiting for event")
}

pub fn id(s: &str) -> TaskId {
    TaskId::from(s)
}
