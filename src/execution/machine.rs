//! Per-task state machine.
//!
//! `TaskStateMachine` owns the lifecycle of one task within a session: it
//! creates an [`Execution`] per attempt, validates every transition, decides
//! between `Retrying` and `Failed` from the task's retry policy, and returns
//! the [`ProgressEvent`] each transition must publish. It performs no I/O;
//! the orchestrator drives it from the dispatch loop.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::core::{Task, TaskId};
use crate::dispatch::{
    CommandMode, DispatchCommand, DispatchResult, ProgressMessage, RemediationHint,
};
use crate::error::{Error, Result};
use crate::events::ProgressEvent;
use crate::execution::record::{Execution, FailureDetail, FailureKind, SessionId};
use crate::execution::state::{TaskState, TransitionEntry};
use crate::verification::VerificationReport;

/// How an attempt ended, as seen by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptFailure {
    pub kind: FailureKind,
    pub message: String,
    /// False for failures that must not consume further attempts.
    pub retryable: bool,
    pub remediation: Option<RemediationHint>,
}

impl AttemptFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind != FailureKind::Blocked,
            remediation: None,
        }
    }

    /// Classify a dispatch error.
    ///
    /// Timeouts and executor failures retry per policy; anything else
    /// (missing executor, duplicate dispatch) fails the task outright.
    pub fn from_error(err: &Error) -> Self {
        let kind = match err {
            Error::Timeout(_) => FailureKind::Timeout,
            Error::VerificationFailure(_) => FailureKind::VerificationFailure,
            Error::Blocked { .. } => FailureKind::Blocked,
            _ => FailureKind::ExecutorFailure,
        };
        Self {
            kind,
            message: err.to_string(),
            retryable: err.is_retryable(),
            remediation: None,
        }
    }

    /// An executor that answered with `success: false`.
    pub fn from_result(result: &DispatchResult) -> Self {
        let last_line = result
            .output
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("no output");
        Self {
            remediation: result.remediation.clone(),
            ..Self::new(
                FailureKind::ExecutorFailure,
                format!("executor reported failure: {}", last_line.trim()),
            )
        }
    }
}

/// Result of closing out an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Complete(ProgressEvent),
    /// Re-queue after `delay`.
    Retry { delay: Duration, event: ProgressEvent },
    Failed(ProgressEvent),
}

impl AttemptOutcome {
    pub fn event(&self) -> &ProgressEvent {
        match self {
            AttemptOutcome::Complete(event) => event,
            AttemptOutcome::Retry { event, .. } => event,
            AttemptOutcome::Failed(event) => event,
        }
    }

    pub fn state(&self) -> TaskState {
        self.event().state
    }
}

/// Point-in-time view of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub task_id: TaskId,
    pub state: TaskState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub critical: bool,
    /// Failed critical task keeping this one pending.
    pub blocked_by: Option<TaskId>,
    pub execution: Option<Execution>,
    pub failure: Option<FailureDetail>,
    /// Executions from earlier attempts.
    pub previous_attempts: usize,
}

impl ExecutionSnapshot {
    /// Snapshot for a task that has not been claimed yet.
    pub fn pending(task: &Task, blocked_by: Option<TaskId>) -> Self {
        Self {
            task_id: task.id().clone(),
            state: TaskState::Pending,
            attempts: 0,
            max_attempts: task.retry().max_attempts,
            critical: task.is_critical(),
            blocked_by,
            execution: None,
            failure: None,
            previous_attempts: 0,
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked_by.is_some()
    }

    pub fn percent(&self) -> u8 {
        match self.state {
            TaskState::Complete => 100,
            _ => self.execution.as_ref().map(|e| e.progress).unwrap_or(0),
        }
    }
}

/// Lifecycle of one task within a session.
#[derive(Debug, Clone)]
pub struct TaskStateMachine {
    task: Arc<Task>,
    state: TaskState,
    /// Attempts made against the current budget.
    attempts: u32,
    current: Option<Execution>,
    history: Vec<Execution>,
    transitions: Vec<TransitionEntry>,
    failure: Option<FailureDetail>,
    /// Parameter overrides from manual or advised re-runs.
    overrides: BTreeMap<String, serde_json::Value>,
    reruns: u32,
}

impl TaskStateMachine {
    pub fn new(task: Arc<Task>) -> Self {
        Self {
            task,
            state: TaskState::Pending,
            attempts: 0,
            current: None,
            history: Vec::new(),
            transitions: Vec::new(),
            failure: None,
            overrides: BTreeMap::new(),
            reruns: 0,
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn task_id(&self) -> &TaskId {
        self.task.id()
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn current(&self) -> Option<&Execution> {
        self.current.as_ref()
    }

    /// Executions from earlier attempts, oldest first.
    pub fn history(&self) -> &[Execution] {
        &self.history
    }

    pub fn transitions(&self) -> &[TransitionEntry] {
        &self.transitions
    }

    pub fn failure(&self) -> Option<&FailureDetail> {
        self.failure.as_ref()
    }

    pub fn overrides(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.overrides
    }

    pub fn reruns(&self) -> u32 {
        self.reruns
    }

    /// `Pending`/`Retrying` -> `Queued`, opening a fresh execution.
    pub fn queue(&mut self, session_id: SessionId) -> Result<ProgressEvent> {
        self.state.check_transition(TaskState::Queued)?;
        if let Some(previous) = self.current.take() {
            self.history.push(previous);
        }
        self.attempts += 1;
        self.current = Some(Execution::new(
            self.task.id().clone(),
            session_id,
            self.attempts,
        ));
        self.move_to(TaskState::Queued)?;
        Ok(self.event(format!("queued (attempt {})", self.attempts)))
    }

    /// `Queued` -> `Running`; returns the command to dispatch.
    pub fn start(&mut self) -> Result<(DispatchCommand, ProgressEvent)> {
        self.state.check_transition(TaskState::Running)?;
        let command = self.command()?;
        self.move_to(TaskState::Running)?;
        if let Some(exec) = self.current.as_mut() {
            exec.started_at = Some(Utc::now());
        }
        let event = self.event(format!("dispatched to {}", self.task.executor()));
        Ok((command, event))
    }

    /// Fold executor progress into the current attempt.
    ///
    /// Returns `None` when the message is stale (another attempt) or the
    /// task is not running.
    pub fn progress(&mut self, msg: &ProgressMessage) -> Option<ProgressEvent> {
        if !self.state.is_active() {
            return None;
        }
        let exec = self.current.as_mut()?;
        if !exec.apply_progress(msg) {
            return None;
        }
        let mut event = self.event(msg.message.clone());
        event.output = msg.output.clone();
        Some(event)
    }

    /// Republish the current progress of a running attempt.
    pub fn heartbeat(&self) -> Option<ProgressEvent> {
        if self.state != TaskState::Running {
            return None;
        }
        let started = self.current.as_ref()?.started_at?;
        let elapsed = (Utc::now() - started).num_seconds().max(0);
        Some(self.event(format!("still running ({}s)", elapsed)))
    }

    /// `Running` -> `Verifying` after the executor reports success.
    pub fn begin_verification(&mut self, result: &DispatchResult) -> Result<ProgressEvent> {
        self.state.check_transition(TaskState::Verifying)?;
        if let Some(exec) = self.current.as_mut() {
            exec.set_output(&result.output);
        }
        self.move_to(TaskState::Verifying)?;
        let steps = self.task.verification().len();
        Ok(self.event(format!("verifying ({} checks)", steps)))
    }

    /// Close out verification: `Complete` when every step passed, otherwise
    /// a verification failure.
    pub fn finish_verification(&mut self, report: VerificationReport) -> Result<AttemptOutcome> {
        if self.state != TaskState::Verifying {
            return Err(Error::InvalidTransition {
                from: self.state.to_string(),
                to: TaskState::Complete.to_string(),
            });
        }
        let summary = report.summary();
        let first_failure = report.first_failure().cloned();
        if let Some(exec) = self.current.as_mut() {
            exec.verification = report.results;
        }

        match first_failure {
            None => {
                self.move_to(TaskState::Complete)?;
                if let Some(exec) = self.current.as_mut() {
                    exec.progress = 100;
                }
                Ok(AttemptOutcome::Complete(self.event(summary)))
            }
            Some(failed) => {
                let message = format!(
                    "{}: {} (expected {}, observed {:?})",
                    summary,
                    failed.step,
                    failed.expected,
                    failed.observed.trim()
                );
                self.fail(AttemptFailure::new(FailureKind::VerificationFailure, message))
            }
        }
    }

    /// Close out an attempt the executor answered with `success: false`.
    ///
    /// The executor's captured output replaces whatever was streamed so the
    /// failure detail carries all of it.
    pub fn reject(&mut self, result: &DispatchResult) -> Result<AttemptOutcome> {
        if self.state.is_active() {
            if let Some(exec) = self.current.as_mut() {
                exec.set_output(&result.output);
            }
        }
        self.fail(AttemptFailure::from_result(result))
    }

    /// Close out a failed attempt.
    ///
    /// Moves to `Retrying` while the policy allows another attempt and the
    /// failure is retryable, otherwise to `Failed` with failure detail.
    pub fn fail(&mut self, failure: AttemptFailure) -> Result<AttemptOutcome> {
        if !self.state.is_active() {
            return Err(Error::InvalidTransition {
                from: self.state.to_string(),
                to: TaskState::Failed.to_string(),
            });
        }
        let policy = self.task.retry();

        if failure.retryable && policy.should_retry(self.attempts) {
            let delay = policy.delay_for(self.attempts);
            self.move_to(TaskState::Retrying)?;
            let event = self.event(format!(
                "{} ({}), retrying in {:?}",
                failure.message, failure.kind, delay
            ));
            return Ok(AttemptOutcome::Retry { delay, event });
        }

        self.move_to(TaskState::Failed)?;
        let mut detail = FailureDetail::new(failure.kind, &failure.message, self.attempts);
        detail.remediation = failure.remediation;
        if let Some(exec) = &self.current {
            detail.output = exec.output.clone();
            detail.verification = exec.verification.clone();
        }
        self.failure = Some(detail);
        Ok(AttemptOutcome::Failed(self.event(format!(
            "failed after {} attempt(s): {}",
            self.attempts, failure.message
        ))))
    }

    /// Any non-terminal state -> `Cancelled`.
    pub fn cancel(&mut self) -> Result<ProgressEvent> {
        self.move_to(TaskState::Cancelled)?;
        Ok(self.event("cancelled"))
    }

    /// Attach (or replace) the remediation hint on a terminal failure.
    pub fn attach_remediation(&mut self, hint: RemediationHint) -> bool {
        match self.failure.as_mut() {
            Some(detail) => {
                detail.remediation = Some(hint);
                true
            }
            None => false,
        }
    }

    /// `Failed` -> `Pending` with a fresh attempt budget.
    ///
    /// `overrides` are merged over the task parameters for every later
    /// attempt. The failed execution is archived.
    pub fn reset_for_rerun(
        &mut self,
        overrides: BTreeMap<String, serde_json::Value>,
    ) -> Result<ProgressEvent> {
        self.state.check_transition(TaskState::Pending)?;
        if let Some(previous) = self.current.take() {
            self.history.push(previous);
        }
        self.move_to(TaskState::Pending)?;
        self.attempts = 0;
        self.failure = None;
        self.overrides.extend(overrides);
        self.reruns += 1;
        Ok(self.event(format!("re-run {} requested", self.reruns)))
    }

    pub fn snapshot(&self) -> ExecutionSnapshot {
        ExecutionSnapshot {
            task_id: self.task.id().clone(),
            state: self.state,
            attempts: self.attempts,
            max_attempts: self.task.retry().max_attempts,
            critical: self.task.is_critical(),
            blocked_by: None,
            execution: self.current.clone(),
            failure: self.failure.clone(),
            previous_attempts: self.history.len(),
        }
    }

    fn command(&self) -> Result<DispatchCommand> {
        let exec = self
            .current
            .as_ref()
            .ok_or_else(|| Error::Validation(format!("task {} has no open execution", self.task.id())))?;
        let mut params = self.task.params().clone();
        params.extend(self.overrides.clone());
        Ok(DispatchCommand {
            execution_id: exec.id,
            executor: self.task.executor(),
            action: self.task.action().to_string(),
            params,
            timeout: self.task.timeout(),
            verification: self.task.verification().to_vec(),
            attempt: exec.attempt,
            mode: CommandMode::Apply,
        })
    }

    fn move_to(&mut self, target: TaskState) -> Result<()> {
        self.state.check_transition(target)?;
        tracing::debug!(
            task = %self.task.id(),
            from = %self.state,
            to = %target,
            attempt = self.attempts,
            "task transition"
        );
        self.transitions.push(TransitionEntry {
            from: self.state,
            to: target,
            attempt: self.attempts,
            at: Utc::now(),
        });
        self.state = target;
        if let Some(exec) = self.current.as_mut() {
            exec.status = target;
            if target.is_terminal() || target == TaskState::Retrying {
                exec.ended_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    fn event(&self, message: impl Into<String>) -> ProgressEvent {
        let mut event = ProgressEvent::new(self.task.id().clone(), self.state, message);
        if let Some(exec) = &self.current {
            event.execution_id = Some(exec.id);
            event.attempt = exec.attempt;
            event.percent = exec.progress;
        }
        if self.state == TaskState::Complete {
            event.percent = 100;
        }
        event
    }
}
