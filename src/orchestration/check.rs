//! Check-only inventory.
//!
//! [`Inventory`] asks each task's executor to run the task's verification
//! probes in [`CommandMode::Check`], without performing any action, and
//! reports which tasks are already satisfied on the machine. Tasks are
//! checked independently of their prerequisites; the graph is only built to
//! validate the plan and fix the report order.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::{DependencyGraph, Task, TaskId};
use crate::dispatch::{CommandMode, DispatchCommand, Dispatcher, ExecutionId, ExecutorRegistry};
use crate::error::{Error, Result};
use crate::execution::SessionId;
use crate::orchestration::manager::DEFAULT_CONCURRENCY;
use crate::verification::{VerificationEngine, VerificationResult};

/// Whether a task's desired state already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    /// Every verification step passed.
    Satisfied,
    /// At least one verification step failed.
    Unsatisfied,
    /// The task declares no verification steps.
    Unverifiable,
    /// The probes could not be run.
    Error,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Satisfied => "satisfied",
            CheckStatus::Unsatisfied => "unsatisfied",
            CheckStatus::Unverifiable => "unverifiable",
            CheckStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check outcome for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckItem {
    pub task_id: TaskId,
    pub critical: bool,
    pub status: CheckStatus,
    pub results: Vec<VerificationResult>,
    /// First failing step or the reason the probes did not run.
    pub message: Option<String>,
}

impl CheckItem {
    fn new(task: &Task, status: CheckStatus) -> Self {
        Self {
            task_id: task.id().clone(),
            critical: task.is_critical(),
            status,
            results: Vec::new(),
            message: None,
        }
    }

    fn error(task: &Task, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::new(task, CheckStatus::Error)
        }
    }
}

/// Outcome of an inventory check, in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryReport {
    pub session_id: SessionId,
    pub checked_at: DateTime<Utc>,
    pub items: Vec<CheckItem>,
}

impl InventoryReport {
    pub fn total(&self) -> usize {
        self.items.len()
    }

    pub fn count(&self, status: CheckStatus) -> usize {
        self.items.iter().filter(|i| i.status == status).count()
    }

    /// Percentage of all tasks that are satisfied (0.0 for an empty plan).
    pub fn completion_percentage(&self) -> f64 {
        if self.items.is_empty() {
            return 0.0;
        }
        (self.count(CheckStatus::Satisfied) as f64 / self.total() as f64) * 100.0
    }

    /// Tasks a `run` would still have work to do for.
    pub fn outstanding(&self) -> impl Iterator<Item = &CheckItem> {
        self.items
            .iter()
            .filter(|i| i.status != CheckStatus::Satisfied)
    }

    /// No verifiable task is unsatisfied or errored.
    pub fn is_satisfied(&self) -> bool {
        self.items
            .iter()
            .all(|i| matches!(i.status, CheckStatus::Satisfied | CheckStatus::Unverifiable))
    }

    pub fn summary(&self) -> String {
        format!(
            "{}/{} satisfied ({:.0}%), {} unsatisfied, {} unverifiable, {} errors",
            self.count(CheckStatus::Satisfied),
            self.total(),
            self.completion_percentage(),
            self.count(CheckStatus::Unsatisfied),
            self.count(CheckStatus::Unverifiable),
            self.count(CheckStatus::Error),
        )
    }
}

/// Runs verification probes for a task set without applying anything.
pub struct Inventory {
    dispatcher: Dispatcher,
    pool: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl Inventory {
    pub fn new(registry: ExecutorRegistry) -> Self {
        Self::with_concurrency(registry, DEFAULT_CONCURRENCY)
    }

    pub fn with_concurrency(registry: ExecutorRegistry, concurrency: usize) -> Self {
        Self {
            dispatcher: Dispatcher::new(registry),
            pool: Arc::new(Semaphore::new(concurrency.max(1))),
            cancel: CancellationToken::new(),
        }
    }

    /// Abandon every outstanding check; they report `Error`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Check every task.
    ///
    /// # Errors
    /// `DuplicateTask`, `UnknownPrerequisite` or `CycleDetected` when the
    /// tasks do not form a valid graph.
    pub async fn check(&self, tasks: Vec<Task>) -> Result<InventoryReport> {
        let graph = DependencyGraph::build(tasks)?;
        let session_id = SessionId::new();
        info!(session = %session_id.short(), tasks = graph.len(), "inventory check started");

        let items = join_all(graph.tasks().map(|task| self.check_task(task))).await;
        let report = InventoryReport {
            session_id,
            checked_at: Utc::now(),
            items,
        };
        info!(session = %session_id.short(), summary = %report.summary(), "inventory check finished");
        Ok(report)
    }

    async fn check_task(&self, task: &Task) -> CheckItem {
        let steps = task.verification();
        if steps.is_empty() {
            return CheckItem::new(task, CheckStatus::Unverifiable);
        }

        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return CheckItem::error(task, Error::Cancelled.to_string());
            }
            permit = Arc::clone(&self.pool).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(e) => return CheckItem::error(task, e.to_string()),
            },
        };

        let command = DispatchCommand {
            execution_id: ExecutionId::new(),
            executor: task.executor(),
            action: task.action().to_string(),
            params: task.params().clone(),
            timeout: task.timeout(),
            verification: steps.to_vec(),
            attempt: 1,
            mode: CommandMode::Check,
        };
        debug!(task = %task.id(), steps = steps.len(), "checking task");

        let result = match self.dispatcher.dispatch(command, &self.cancel, |_| {}).await {
            Ok(result) => result,
            Err(e) => return CheckItem::error(task, e.to_string()),
        };
        if !result.success {
            let reason = result
                .output
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("probes failed to run");
            return CheckItem::error(task, reason.trim());
        }

        let report = VerificationEngine::verify(&result.output, &result.probes, steps);
        let message = report
            .first_failure()
            .map(|failed| format!("{}: expected {}", failed.step, failed.expected));
        let status = if report.passed() {
            CheckStatus::Satisfied
        } else {
            CheckStatus::Unsatisfied
        };
        CheckItem {
            results: report.results,
            message,
            ..CheckItem::new(task, status)
        }
    }
}

impl std::fmt::Debug for Inventory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inventory")
            .field("available", &self.pool.available_permits())
            .finish()
    }
}
