//! Post-execution verification.
//!
//! A [`VerificationStep`] pairs a probe (the command an executor runs to
//! observe the real-world effect) with an [`Expectation`] about its output.
//! [`VerificationEngine::verify`] evaluates every step against the text
//! captured for it and returns a [`VerificationReport`]. Evaluation is pure:
//! it never touches the machine being provisioned.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Longest slice of observed output kept on a step result.
const MAX_OBSERVED_CHARS: usize = 512;

/// What a probe's output must look like for the step to pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Expectation {
    /// Trimmed output equals the literal.
    Equals(String),
    /// Output contains the literal.
    Contains(String),
    /// Output matches the regular expression.
    Matches(String),
}

impl std::fmt::Display for Expectation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expectation::Equals(s) => write!(f, "equals {:?}", s),
            Expectation::Contains(s) => write!(f, "contains {:?}", s),
            Expectation::Matches(s) => write!(f, "matches /{}/", s),
        }
    }
}

/// A single post-execution check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationStep {
    /// Name used to correlate probe output and results.
    pub name: String,
    /// Command or probe description the executor runs.
    pub probe: String,
    pub expect: Expectation,
}

impl VerificationStep {
    pub fn new(name: &str, probe: &str, expect: Expectation) -> Self {
        Self {
            name: name.to_string(),
            probe: probe.to_string(),
            expect,
        }
    }
}

/// Outcome of one verification step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub step: String,
    pub passed: bool,
    pub expected: String,
    /// Output the expectation was evaluated against (truncated).
    pub observed: String,
    /// Why the step failed, if it did.
    pub detail: Option<String>,
}

/// Ordered results for all steps of one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub results: Vec<VerificationResult>,
}

impl VerificationReport {
    /// True when every step passed (vacuously true with no steps).
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    /// First failing step, which is what gets reported for the execution.
    pub fn first_failure(&self) -> Option<&VerificationResult> {
        self.results.iter().find(|r| !r.passed)
    }

    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| !r.passed).count()
    }

    pub fn summary(&self) -> String {
        if self.results.is_empty() {
            "no verification steps".to_string()
        } else if self.passed() {
            format!("all {} checks passed", self.results.len())
        } else {
            format!("{}/{} checks failed", self.failed_count(), self.results.len())
        }
    }
}

/// Stateless evaluator for verification steps.
#[derive(Debug, Default, Clone, Copy)]
pub struct VerificationEngine;

impl VerificationEngine {
    /// Evaluate every step.
    ///
    /// Each step is checked against `probes[step.name]` when the executor
    /// ran the probe itself, otherwise against the execution's captured
    /// `output`. All steps are evaluated even after a failure so the full
    /// diagnostics are available.
    pub fn verify(
        output: &str,
        probes: &BTreeMap<String, String>,
        steps: &[VerificationStep],
    ) -> VerificationReport {
        let results = steps
            .iter()
            .map(|step| {
                let observed = probes.get(&step.name).map(String::as_str).unwrap_or(output);
                Self::evaluate(step, observed)
            })
            .collect();
        VerificationReport { results }
    }

    /// Evaluate a single step against observed text.
    pub fn evaluate(step: &VerificationStep, observed: &str) -> VerificationResult {
        let (passed, detail) = match &step.expect {
            Expectation::Equals(expected) => {
                let ok = observed.trim() == expected.as_str();
                (ok, (!ok).then(|| format!("expected exactly {:?}", expected)))
            }
            Expectation::Contains(expected) => {
                let ok = observed.contains(expected.as_str());
                (ok, (!ok).then(|| format!("{:?} not found in output", expected)))
            }
            Expectation::Matches(pattern) => match Regex::new(pattern) {
                Ok(re) => {
                    let ok = re.is_match(observed);
                    (ok, (!ok).then(|| format!("no match for /{}/", pattern)))
                }
                Err(e) => (false, Some(format!("invalid pattern /{}/: {}", pattern, e))),
            },
        };

        VerificationResult {
            step: step.name.clone(),
            passed,
            expected: step.expect.to_string(),
            observed: truncate(observed),
            detail,
        }
    }
}

fn truncate(text: &str) -> String {
    match text.char_indices().nth(MAX_OBSERVED_CHARS) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
