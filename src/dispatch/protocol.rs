//! Messages exchanged between the orchestrator and a remote executor.
//!
//! The protocol is transport agnostic: one [`DispatchCommand`] out, an
//! ordered stream of [`ProgressMessage`]s back, then one terminal
//! [`DispatchResult`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use crate::core::ExecutorKind;
use crate::util::duration_ms;
use crate::verification::VerificationStep;

/// Unique identifier for one attempt of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// What an executor should do with a command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandMode {
    /// Perform the action, then run the verification probes.
    #[default]
    Apply,
    /// Run only the verification probes; the action must not be performed.
    Check,
}

/// Work order sent to an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchCommand {
    pub execution_id: ExecutionId,
    pub executor: ExecutorKind,
    pub action: String,
    pub params: BTreeMap<String, serde_json::Value>,
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    pub verification: Vec<VerificationStep>,
    /// 1-indexed attempt number this command belongs to.
    pub attempt: u32,
    #[serde(default)]
    pub mode: CommandMode,
}

/// Incremental progress for one execution.
///
/// `seq` starts at 0 and increases by one per message, so a consumer can
/// detect gaps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressMessage {
    pub execution_id: ExecutionId,
    pub seq: u64,
    pub percent: u8,
    pub message: String,
    pub output: Option<String>,
}

/// Follow-up suggested for a failed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum RemediationAction {
    /// Try again, optionally overriding some parameters.
    Retry {
        #[serde(default)]
        params: BTreeMap<String, serde_json::Value>,
    },
    /// Needs a human.
    Escalate,
    /// Not worth retrying.
    Abort,
}

/// Machine-readable remediation hint from an executor or advisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationHint {
    pub action: RemediationAction,
    pub reason: String,
}

impl RemediationHint {
    pub fn retry(reason: &str) -> Self {
        Self {
            action: RemediationAction::Retry {
                params: BTreeMap::new(),
            },
            reason: reason.to_string(),
        }
    }

    pub fn retry_with(reason: &str, params: BTreeMap<String, serde_json::Value>) -> Self {
        Self {
            action: RemediationAction::Retry { params },
            reason: reason.to_string(),
        }
    }

    pub fn escalate(reason: &str) -> Self {
        Self {
            action: RemediationAction::Escalate,
            reason: reason.to_string(),
        }
    }

    pub fn abort(reason: &str) -> Self {
        Self {
            action: RemediationAction::Abort,
            reason: reason.to_string(),
        }
    }

    pub fn suggests_retry(&self) -> bool {
        matches!(self.action, RemediationAction::Retry { .. })
    }
}

/// Terminal outcome of a dispatched command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchResult {
    pub execution_id: ExecutionId,
    pub success: bool,
    pub output: String,
    /// Probe output keyed by verification step name, when the executor
    /// ran the probes itself.
    #[serde(default)]
    pub probes: BTreeMap<String, String>,
    pub remediation: Option<RemediationHint>,
}

impl DispatchResult {
    pub fn success(execution_id: ExecutionId, output: impl Into<String>) -> Self {
        Self {
            execution_id,
            success: true,
            output: output.into(),
            probes: BTreeMap::new(),
            remediation: None,
        }
    }

    pub fn failure(execution_id: ExecutionId, output: impl Into<String>) -> Self {
        Self {
            success: false,
            ..Self::success(execution_id, output)
        }
    }

    pub fn with_probe(mut self, step: &str, output: impl Into<String>) -> Self {
        self.probes.insert(step.to_string(), output.into());
        self
    }

    pub fn with_remediation(mut self, hint: RemediationHint) -> Self {
        self.remediation = Some(hint);
        self
    }
}
