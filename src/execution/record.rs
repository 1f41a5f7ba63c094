//! Per-attempt execution records and failure detail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::TaskId;
use crate::dispatch::{ExecutionId, ProgressMessage, RemediationHint};
use crate::execution::state::TaskState;
use crate::util::keep_tail;
use crate::verification::VerificationResult;

/// Captured output kept per execution; older output is dropped first.
pub const MAX_OUTPUT_BYTES: usize = 256 * 1024;

/// Unique identifier for an orchestration session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// One attempt at running a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub task_id: TaskId,
    pub session_id: SessionId,
    pub status: TaskState,
    /// 0-100, never decreases within the attempt.
    pub progress: u8,
    pub output: String,
    pub verification: Vec<VerificationResult>,
    /// 1-indexed within the current attempt budget.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Last progress sequence number seen.
    #[serde(default)]
    pub last_seq: Option<u64>,
}

impl Execution {
    pub fn new(task_id: TaskId, session_id: SessionId, attempt: u32) -> Self {
        Self {
            id: ExecutionId::new(),
            task_id,
            session_id,
            status: TaskState::Queued,
            progress: 0,
            output: String::new(),
            verification: Vec::new(),
            attempt,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            last_seq: None,
        }
    }

    /// Fold a progress message into the record.
    ///
    /// Returns false when the message belongs to another execution.
    pub fn apply_progress(&mut self, msg: &ProgressMessage) -> bool {
        if msg.execution_id != self.id {
            return false;
        }
        let expected = self.last_seq.map(|s| s + 1).unwrap_or(0);
        if msg.seq != expected {
            tracing::warn!(
                execution = %self.id.short(),
                expected,
                got = msg.seq,
                "progress sequence gap"
            );
        }
        self.last_seq = Some(msg.seq);
        self.progress = self.progress.max(msg.percent.min(100));
        if let Some(fragment) = &msg.output {
            self.append_output(fragment);
        }
        true
    }

    /// Append a line of output, keeping at most [`MAX_OUTPUT_BYTES`].
    pub fn append_output(&mut self, fragment: &str) {
        self.output.push_str(fragment);
        if !fragment.ends_with('\n') {
            self.output.push('\n');
        }
        keep_tail(&mut self.output, MAX_OUTPUT_BYTES);
    }

    /// Replace streamed output with the executor's final capture.
    pub fn set_output(&mut self, output: &str) {
        if output.is_empty() {
            return;
        }
        self.output = output.to_string();
        keep_tail(&mut self.output, MAX_OUTPUT_BYTES);
    }
}

/// Category of a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    ExecutorFailure,
    VerificationFailure,
    Blocked,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::ExecutorFailure => "executor_failure",
            FailureKind::VerificationFailure => "verification_failure",
            FailureKind::Blocked => "blocked",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task ended up failed, with everything needed to diagnose it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub kind: FailureKind,
    pub message: String,
    pub attempts: u32,
    pub output: String,
    pub verification: Vec<VerificationResult>,
    pub remediation: Option<RemediationHint>,
    pub at: DateTime<Utc>,
}

impl FailureDetail {
    pub fn new(kind: FailureKind, message: impl Into<String>, attempts: u32) -> Self {
        Self {
            kind,
            message: message.into(),
            attempts,
            output: String::new(),
            verification: Vec::new(),
            remediation: None,
            at: Utc::now(),
        }
    }
}
