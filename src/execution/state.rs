//! Task lifecycle states with transition validation.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Lifecycle state of one task within a session.
///
/// ```text
/// Pending -> Queued -> Running -> Verifying -> Complete
///                        |            |
///                        +-> Retrying <-+ -> Queued
///                        +-> Failed  <--+
/// ```
///
/// `Cancelled` is reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Queued,
    Running,
    Verifying,
    Retrying,
    Complete,
    Failed,
    Cancelled,
}

impl TaskState {
    pub const ALL: [TaskState; 8] = [
        TaskState::Pending,
        TaskState::Queued,
        TaskState::Running,
        TaskState::Verifying,
        TaskState::Retrying,
        TaskState::Complete,
        TaskState::Failed,
        TaskState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Verifying => "verifying",
            TaskState::Retrying => "retrying",
            TaskState::Complete => "complete",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Complete | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// Whether an attempt is currently out with an executor.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskState::Running | TaskState::Verifying)
    }

    /// Check whether moving from `self` to `target` is allowed.
    ///
    /// `Failed -> Pending` is the manual re-run path; every other edge
    /// follows the attempt lifecycle.
    pub fn can_transition(&self, target: TaskState) -> bool {
        use TaskState::*;
        if target == Cancelled {
            return !self.is_terminal();
        }
        matches!(
            (self, target),
            (Pending, Queued)
                | (Queued, Running)
                | (Running, Verifying)
                | (Running, Retrying)
                | (Running, Failed)
                | (Verifying, Complete)
                | (Verifying, Retrying)
                | (Verifying, Failed)
                | (Retrying, Queued)
                | (Retrying, Failed)
                | (Failed, Pending)
        )
    }

    /// Validate a transition, returning `InvalidTransition` when rejected.
    pub fn check_transition(&self, target: TaskState) -> Result<()> {
        if self.can_transition(target) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                from: self.to_string(),
                to: target.to_string(),
            })
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record of a state change with timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionEntry {
    pub from: TaskState,
    pub to: TaskState,
    pub attempt: u32,
    pub at: DateTime<Utc>,
}
