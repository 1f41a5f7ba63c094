//! Failure propagation and remediation integration tests.
//!
//! These tests verify how a terminal failure affects the rest of the
//! session: blocking of dependents, advisor hints and re-runs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use provisor::dispatch::{RemediationAction, RemediationHint};
use provisor::execution::TaskState;
use provisor::orchestration::{OrchestratorConfig, PatternAdvisor};
use provisor::Error;

use crate::fixtures::{
    collect, fast_config, id, orchestrator, orchestrator_with, position, task, wait_for, Behavior,
    FixedAdvisor, ScriptedExecutor,
};

/// Test: Critical failure blocks dependents
/// Given A (critical) fails and B, C depend on it transitively
/// When the session runs
/// Then B and C stay Pending, blocked by A, and are never queued
#[tokio::test]
async fn test_critical_failure_blocks_dependents() {
    let executor = Arc::new(ScriptedExecutor::new().behave("a", Behavior::Fail("exit 1")));
    let orch = orchestrator(
        vec![
            task("a"),
            task("b").depends_on("a"),
            task("c").depends_on("b"),
            task("d"),
        ],
        &executor,
    );
    let events = orch.subscribe();

    let report = orch.run().await.unwrap();
    let events = collect(events).await;

    assert!(!report.is_success());
    assert_eq!(report.counts.failed_critical, 1);
    assert_eq!(report.counts.blocked, 2);
    assert_eq!(report.completed, vec![id("d")]);
    assert_eq!(report.critical_failures().count(), 1);

    for dependent in ["b", "c"] {
        let status = orch.status(&id(dependent)).unwrap();
        assert_eq!(status.state, TaskState::Pending);
        assert_eq!(status.blocked_by, Some(id("a")));
        assert!(position(&events, dependent, TaskState::Queued).is_none());

        let blocked: Vec<_> = events
            .iter()
            .filter(|e| e.task_id.as_str() == dependent && e.is_blocked())
            .collect();
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].blocked_by, Some(id("a")));
    }
    assert_eq!(executor.actions().len(), 2);
}

/// Test: Non-critical failure does not block
/// Given A (non-critical) fails and B depends on it
/// When the session runs
/// Then B still runs and the session counts as successful
#[tokio::test]
async fn test_non_critical_failure_does_not_block() {
    let executor = Arc::new(ScriptedExecutor::new().behave("a", Behavior::Fail("exit 1")));
    let orch = orchestrator(
        vec![task("a").critical(false), task("b").depends_on("a")],
        &executor,
    );

    let report = orch.run().await.unwrap();

    assert_eq!(report.counts.failed_non_critical, 1);
    assert_eq!(report.completed, vec![id("b")]);
    assert!(report.blocked.is_empty());
    assert!(report.is_success());
    assert_eq!(report.critical_failures().count(), 0);
}

/// Test: Advisor hint attached to the failure
#[tokio::test]
async fn test_advisor_hint_attached() {
    let executor = Arc::new(
        ScriptedExecutor::new().behave("a", Behavior::Fail("curl: connection reset by peer")),
    );
    let orch = orchestrator_with(
        vec![task("a")],
        &executor,
        fast_config(),
        Some(Arc::new(PatternAdvisor::new())),
    );

    let report = orch.run().await.unwrap();

    let hint = report.failed[0].detail.remediation.clone().unwrap();
    assert!(hint.suggests_retry());
    assert!(hint.reason.contains("connection reset"));
}

/// Test: Fatal output is classified as abort
#[tokio::test]
async fn test_fatal_failure_advised_to_abort() {
    let executor = Arc::new(
        ScriptedExecutor::new().behave("a", Behavior::Fail("E: Unable to locate package nvim")),
    );
    let orch = orchestrator_with(
        vec![task("a")],
        &executor,
        fast_config(),
        Some(Arc::new(PatternAdvisor::new())),
    );

    orch.run().await.unwrap();

    let failure = orch.status(&id("a")).unwrap().failure.unwrap();
    assert_eq!(
        failure.remediation.map(|h| h.action),
        Some(RemediationAction::Abort)
    );
}

/// Test: Failure detail carries the full executor output
/// Given an executor that fails with a fatal line followed by a cleanup line
/// When the session runs
/// Then the failure output keeps both lines and the fatal line drives the hint
#[tokio::test]
async fn test_failure_keeps_output_before_last_line() {
    let executor = Arc::new(ScriptedExecutor::new().behave(
        "a",
        Behavior::Fail("E: Unable to locate package foo\ncleanup done"),
    ));
    let orch = orchestrator_with(
        vec![task("a")],
        &executor,
        fast_config(),
        Some(Arc::new(PatternAdvisor::new())),
    );

    orch.run().await.unwrap();

    let failure = orch.status(&id("a")).unwrap().failure.unwrap();
    assert!(failure.message.contains("cleanup done"));
    assert!(failure.output.contains("Unable to locate package foo"));
    assert!(failure.output.contains("cleanup done"));
    assert_eq!(
        failure.remediation.map(|h| h.action),
        Some(RemediationAction::Abort)
    );
}

/// Test: Executor hint takes precedence over the advisor
#[tokio::test]
async fn test_executor_hint_wins() {
    let executor = Arc::new(ScriptedExecutor::new().behave(
        "a",
        Behavior::FailWithHint(RemediationHint::abort("disk full")),
    ));
    let config = OrchestratorConfig {
        auto_remediate: true,
        ..fast_config()
    };
    let orch = orchestrator_with(
        vec![task("a")],
        &executor,
        config,
        Some(Arc::new(PatternAdvisor::new())),
    );

    orch.run().await.unwrap();

    let failure = orch.status(&id("a")).unwrap().failure.unwrap();
    assert_eq!(failure.remediation, Some(RemediationHint::abort("disk full")));
    assert_eq!(executor.calls_for("a"), 1);
}

/// Test: Auto-remediation re-runs a failed task once
#[tokio::test]
async fn test_auto_remediation_reruns_once() {
    let executor = Arc::new(
        ScriptedExecutor::new().behave("a", Behavior::Fail("connection reset by peer")),
    );
    let config = OrchestratorConfig {
        auto_remediate: true,
        ..fast_config()
    };
    let orch = orchestrator_with(
        vec![task("a")],
        &executor,
        config,
        Some(Arc::new(PatternAdvisor::new())),
    );

    orch.run().await.unwrap();

    assert_eq!(executor.calls_for("a"), 2);
    let status = orch.status(&id("a")).unwrap();
    assert_eq!(status.state, TaskState::Failed);
    assert_eq!(status.attempts, 1);
    assert_eq!(status.previous_attempts, 1);
}

/// Test: Auto-remediation with parameter overrides releases dependents
/// Given a critical task that only succeeds with a "mirror" parameter
/// When the advisor suggests retrying with that parameter
/// Then the task completes on re-run and its blocked dependent runs
#[tokio::test]
async fn test_auto_remediation_with_overrides_unblocks() {
    let executor = Arc::new(ScriptedExecutor::new().behave("pkg", Behavior::RequireParam("mirror")));
    let mut params = BTreeMap::new();
    params.insert("mirror".to_string(), serde_json::json!("https://mirror.example"));
    let config = OrchestratorConfig {
        auto_remediate: true,
        ..fast_config()
    };
    let orch = orchestrator_with(
        vec![task("pkg"), task("app").depends_on("pkg")],
        &executor,
        config,
        Some(Arc::new(FixedAdvisor(RemediationHint::retry_with(
            "switch mirror",
            params,
        )))),
    );
    let events = orch.subscribe();

    let report = orch.run().await.unwrap();
    let events = collect(events).await;

    assert!(report.is_success());
    assert_eq!(report.completed, vec![id("pkg"), id("app")]);
    assert!(events.iter().any(|e| e.task_id.as_str() == "app" && e.is_blocked()));

    let calls = executor.calls();
    assert_eq!(executor.calls_for("pkg"), 2);
    assert!(!calls[0].params.contains_key("mirror"));
    assert!(calls[1].params.contains_key("mirror"));
    assert_eq!(calls[2].action, "app");
}

/// Test: Manual re-run while the session is live
#[tokio::test]
async fn test_manual_rerun_with_overrides() {
    let executor = Arc::new(
        ScriptedExecutor::new()
            .behave("a", Behavior::RequireParam("version"))
            .behave("slow", Behavior::Sleep(Duration::from_millis(400))),
    );
    let orch = orchestrator(vec![task("a"), task("slow"), task("b").depends_on("a")], &executor);
    let mut events = orch.subscribe();

    let runner = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.run().await })
    };

    wait_for(&mut events, "a", TaskState::Failed).await;
    let mut overrides = BTreeMap::new();
    overrides.insert("version".to_string(), serde_json::json!("1.2"));
    orch.rerun(&id("a"), overrides).unwrap();

    let report = runner.await.unwrap().unwrap();

    assert!(report.is_success());
    assert_eq!(report.counts.complete, 3);
    assert_eq!(executor.calls_for("a"), 2);
}

/// Test: Re-run rejects tasks that have not failed
#[tokio::test]
async fn test_rerun_preconditions() {
    let executor = Arc::new(ScriptedExecutor::new());
    let orch = orchestrator(vec![task("a")], &executor);

    assert!(matches!(
        orch.rerun(&id("zzz"), BTreeMap::new()),
        Err(Error::TaskNotFound(_))
    ));
    assert!(matches!(
        orch.rerun(&id("a"), BTreeMap::new()),
        Err(Error::InvalidTransition { .. })
    ));

    orch.run().await.unwrap();
    assert!(matches!(
        orch.rerun(&id("a"), BTreeMap::new()),
        Err(Error::SessionClosed)
    ));
}
