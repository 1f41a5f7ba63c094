use std::time::Duration;

use thiserror::Error;

use crate::core::TaskId;
use crate::dispatch::ExecutionId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Duplicate task: {0}")]
    DuplicateTask(TaskId),

    #[error("Cycle detected: {}", format_cycle(.cycle))]
    CycleDetected { cycle: Vec<TaskId> },

    #[error("Task {task} depends on unknown task {prerequisite}")]
    UnknownPrerequisite { task: TaskId, prerequisite: TaskId },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Execution {0} already has an outstanding command")]
    DuplicateDispatch(ExecutionId),

    #[error("No executor registered for kind: {0}")]
    NoExecutor(String),

    #[error("Executor already registered for kind: {0}")]
    ExecutorExists(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Executor failure: {0}")]
    ExecutorFailure(String),

    #[error("Verification failed: {0}")]
    VerificationFailure(String),

    #[error("Task {task} blocked by failed task {blocker}")]
    Blocked { task: TaskId, blocker: TaskId },

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Session is closed")]
    SessionClosed,
}

pub type Result<T> = std::result::Result<T, Error>;

fn format_cycle(cycle: &[TaskId]) -> String {
    cycle
        .iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl Error {
    /// Whether the failure counts against the retry budget and may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::ExecutorFailure(_) | Error::VerificationFailure(_)
        )
    }
}
