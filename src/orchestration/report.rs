//! Session summaries.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{Task, TaskId};
use crate::execution::{
    Execution, ExecutionSnapshot, FailureDetail, SessionId, TaskState, TransitionEntry,
};

/// Number of tasks in each bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub pending: usize,
    pub active: usize,
    pub complete: usize,
    pub failed_critical: usize,
    pub failed_non_critical: usize,
    pub blocked: usize,
    pub cancelled: usize,
}

/// A task that ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTask {
    pub task_id: TaskId,
    pub critical: bool,
    pub detail: FailureDetail,
}

/// A task held back by a failed critical prerequisite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedTask {
    pub task_id: TaskId,
    pub blocked_by: TaskId,
}

/// Outcome of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total: usize,
    pub counts: StateCounts,
    pub completed: Vec<TaskId>,
    pub failed: Vec<FailedTask>,
    pub blocked: Vec<BlockedTask>,
    pub cancelled: Vec<TaskId>,
}

impl SessionReport {
    /// Build a report from per-task snapshots (declaration order).
    pub fn from_snapshots(
        session_id: SessionId,
        started_at: DateTime<Utc>,
        finished_at: Option<DateTime<Utc>>,
        snapshots: &[ExecutionSnapshot],
    ) -> Self {
        let mut report = Self {
            session_id,
            started_at,
            finished_at,
            total: snapshots.len(),
            counts: StateCounts::default(),
            completed: Vec::new(),
            failed: Vec::new(),
            blocked: Vec::new(),
            cancelled: Vec::new(),
        };

        for snap in snapshots {
            if let Some(blocker) = &snap.blocked_by {
                report.counts.blocked += 1;
                report.blocked.push(BlockedTask {
                    task_id: snap.task_id.clone(),
                    blocked_by: blocker.clone(),
                });
                continue;
            }
            match snap.state {
                TaskState::Pending => report.counts.pending += 1,
                TaskState::Queued
                | TaskState::Running
                | TaskState::Verifying
                | TaskState::Retrying => report.counts.active += 1,
                TaskState::Complete => {
                    report.counts.complete += 1;
                    report.completed.push(snap.task_id.clone());
                }
                TaskState::Failed => {
                    if snap.critical {
                        report.counts.failed_critical += 1;
                    } else {
                        report.counts.failed_non_critical += 1;
                    }
                    if let Some(detail) = &snap.failure {
                        report.failed.push(FailedTask {
                            task_id: snap.task_id.clone(),
                            critical: snap.critical,
                            detail: detail.clone(),
                        });
                    }
                }
                TaskState::Cancelled => {
                    report.counts.cancelled += 1;
                    report.cancelled.push(snap.task_id.clone());
                }
            }
        }
        report
    }

    /// Percentage of tasks that completed (0.0 for an empty session).
    pub fn completion_percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.counts.complete as f64 / self.total as f64) * 100.0
    }

    /// No critical failures, nothing blocked, cancelled or left pending.
    pub fn is_success(&self) -> bool {
        self.counts.complete + self.counts.failed_non_critical == self.total
    }

    pub fn critical_failures(&self) -> impl Iterator<Item = &FailedTask> {
        self.failed.iter().filter(|f| f.critical)
    }

    pub fn summary(&self) -> String {
        format!(
            "{}/{} complete ({:.0}%), {} failed ({} critical), {} blocked, {} cancelled",
            self.counts.complete,
            self.total,
            self.completion_percentage(),
            self.counts.failed_critical + self.counts.failed_non_critical,
            self.counts.failed_critical,
            self.counts.blocked,
            self.counts.cancelled,
        )
    }
}

/// Everything recorded about one task, for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task: Task,
    pub snapshot: ExecutionSnapshot,
    /// Executions from earlier attempts, oldest first.
    pub history: Vec<Execution>,
    pub transitions: Vec<TransitionEntry>,
}

/// Durable shape of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub report: SessionReport,
    pub tasks: Vec<TaskRecord>,
    /// Free-form labels (plan path, host).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl SessionRecord {
    pub fn task(&self, id: &TaskId) -> Option<&TaskRecord> {
        self.tasks.iter().find(|t| t.task.id() == id)
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}
