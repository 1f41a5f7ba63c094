//! Failure advice.
//!
//! An [`Advisor`] looks at a terminal failure and suggests a
//! [`RemediationHint`]. Advisors are side-effect free: the orchestrator
//! decides whether to act on the hint.
//!
//! [`PatternAdvisor`] classifies failures by scanning the captured output:
//! - transient errors (network, mirrors, locks) -> `Retry`
//! - fatal errors (permissions, missing packages) -> `Abort`
//! - anything else -> `Escalate`

use async_trait::async_trait;

use crate::core::Task;
use crate::dispatch::RemediationHint;
use crate::execution::{FailureDetail, FailureKind};

/// Suggests what to do about a failed task.
#[async_trait]
pub trait Advisor: Send + Sync {
    /// Return a hint for the failure, or `None` to stay silent.
    async fn advise(&self, task: &Task, failure: &FailureDetail) -> Option<RemediationHint>;
}

/// Output patterns that usually clear up on their own.
const TRANSIENT_PATTERNS: &[&str] = &[
    "timed out",
    "timeout",
    "temporary failure",
    "temporarily unavailable",
    "connection refused",
    "connection reset",
    "network is unreachable",
    "could not resolve",
    "could not get lock",
    "resource busy",
    "503",
    "502",
];

/// Output patterns that a retry will not fix.
const FATAL_PATTERNS: &[&str] = &[
    "permission denied",
    "access denied",
    "authentication failed",
    "unable to locate package",
    "no such file or directory",
    "command not found",
    "not supported",
];

/// Configuration for [`PatternAdvisor`].
#[derive(Debug, Clone)]
pub struct AdvisorConfig {
    pub transient_patterns: Vec<String>,
    pub fatal_patterns: Vec<String>,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            transient_patterns: TRANSIENT_PATTERNS.iter().map(|p| p.to_string()).collect(),
            fatal_patterns: FATAL_PATTERNS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl AdvisorConfig {
    pub fn add_transient_pattern(&mut self, pattern: &str) {
        self.transient_patterns.push(pattern.to_lowercase());
    }

    pub fn add_fatal_pattern(&mut self, pattern: &str) {
        self.fatal_patterns.push(pattern.to_lowercase());
    }
}

/// Keyword-based advisor.
#[derive(Debug, Clone, Default)]
pub struct PatternAdvisor {
    config: AdvisorConfig,
}

impl PatternAdvisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: AdvisorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AdvisorConfig {
        &self.config
    }

    /// Synchronous classification used by [`Advisor::advise`].
    pub fn classify(&self, failure: &FailureDetail) -> RemediationHint {
        let haystack = format!("{}\n{}", failure.message, failure.output).to_lowercase();

        if let Some(pattern) = self
            .config
            .fatal_patterns
            .iter()
            .find(|p| haystack.contains(p.as_str()))
        {
            return RemediationHint::abort(&format!("fatal error pattern: {}", pattern));
        }

        if failure.kind == FailureKind::Timeout {
            return RemediationHint::retry("executor timed out");
        }

        if let Some(pattern) = self
            .config
            .transient_patterns
            .iter()
            .find(|p| haystack.contains(p.as_str()))
        {
            return RemediationHint::retry(&format!("transient error pattern: {}", pattern));
        }

        if failure.kind == FailureKind::VerificationFailure {
            return RemediationHint::escalate("action ran but its effect could not be verified");
        }

        RemediationHint::escalate(&format!(
            "failed after {} attempt(s) with no recognised cause",
            failure.attempts
        ))
    }
}

#[async_trait]
impl Advisor for PatternAdvisor {
    async fn advise(&self, task: &Task, failure: &FailureDetail) -> Option<RemediationHint> {
        let hint = self.classify(failure);
        tracing::debug!(task = %task.id(), hint = ?hint.action, reason = %hint.reason, "advisor hint");
        Some(hint)
    }
}
