//! Task data model for the dependency graph.
//!
//! Tasks are the atomic units of provisioning work. Each task names the
//! executor capability that performs it, the action and parameters to send,
//! the tasks that must finish first, and how its outcome is verified.
//! A task is immutable once built; the builder methods consume `self`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::core::retry::RetryPolicy;
use crate::util::duration_ms;
use crate::verification::VerificationStep;

/// Default time a single attempt may run before it is treated as failed.
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Identifier of a task, as declared by the task source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The remote capability that handles a task.
///
/// Executors are looked up by kind in the
/// [`ExecutorRegistry`](crate::dispatch::ExecutorRegistry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    /// Shell environment: login shell, dotfiles, symlinks.
    Shell,
    /// Language runtimes and tool versions.
    Toolchain,
    /// Host-side Windows configuration.
    Windows,
    /// Cross-cutting coordination steps (checks, summaries).
    Coordinator,
}

impl ExecutorKind {
    pub const ALL: [ExecutorKind; 4] = [
        ExecutorKind::Shell,
        ExecutorKind::Toolchain,
        ExecutorKind::Windows,
        ExecutorKind::Coordinator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorKind::Shell => "shell",
            ExecutorKind::Toolchain => "toolchain",
            ExecutorKind::Windows => "windows",
            ExecutorKind::Coordinator => "coordinator",
        }
    }
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutorKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ExecutorKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| crate::Error::Validation(format!("unknown executor kind: {}", s)))
    }
}

fn default_timeout() -> Duration {
    Duration::from_secs(DEFAULT_TIMEOUT_SECS)
}

fn default_critical() -> bool {
    true
}

/// A single unit of provisioning work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    #[serde(default)]
    description: String,
    executor: ExecutorKind,
    action: String,
    #[serde(default)]
    params: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    prerequisites: Vec<TaskId>,
    #[serde(default)]
    retry: RetryPolicy,
    #[serde(default)]
    verification: Vec<VerificationStep>,
    #[serde(rename = "timeout_ms", default = "default_timeout", with = "duration_ms")]
    timeout: Duration,
    #[serde(default = "default_critical")]
    critical: bool,
}

impl Task {
    /// Create a task with default retry policy, timeout and criticality.
    pub fn new(id: impl Into<TaskId>, executor: ExecutorKind, action: &str) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            executor,
            action: action.to_string(),
            params: BTreeMap::new(),
            prerequisites: Vec::new(),
            retry: RetryPolicy::default(),
            verification: Vec::new(),
            timeout: default_timeout(),
            critical: true,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_param(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// Add a prerequisite. Repeated identifiers are ignored.
    pub fn depends_on(mut self, id: impl Into<TaskId>) -> Self {
        let id = id.into();
        if !self.prerequisites.contains(&id) {
            self.prerequisites.push(id);
        }
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_verification(mut self, step: VerificationStep) -> Self {
        self.verification.push(step);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Mark whether a terminal failure of this task blocks its dependents.
    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    /// Collapse duplicate prerequisites, keeping first-declared order.
    ///
    /// Deserialized tasks bypass `depends_on`, so the graph normalizes on add.
    pub(crate) fn normalized(mut self) -> Self {
        let mut seen = std::collections::HashSet::new();
        self.prerequisites.retain(|id| seen.insert(id.clone()));
        self
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn executor(&self) -> ExecutorKind {
        self.executor
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn params(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.params
    }

    pub fn prerequisites(&self) -> &[TaskId] {
        &self.prerequisites
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn verification(&self) -> &[VerificationStep] {
        &self.verification
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_critical(&self) -> bool {
        self.critical
    }
}
