//! Retry and verification integration tests.
//!
//! These tests verify that retry budgets are honoured, failures are
//! classified correctly and verification decides whether a task completes.

use std::sync::Arc;
use std::time::Duration;

use provisor::core::{ExecutorKind, RetryPolicy, Task};
use provisor::execution::{FailureKind, TaskState};
use provisor::verification::{Expectation, VerificationStep};

use crate::fixtures::{collect, id, orchestrator, states_for, task, Behavior, ScriptedExecutor};

/// Test: Retry budget exhausted
/// Given a task with max_attempts = 3 whose executor always fails
/// When the session runs
/// Then the task is Failed after exactly three attempts
#[tokio::test]
async fn test_three_failures_end_in_failed() {
    let executor = Arc::new(ScriptedExecutor::new().behave("a", Behavior::Fail("exit status 1")));
    let orch = orchestrator(
        vec![task("a").with_retry(RetryPolicy::fixed(3, Duration::from_millis(5)))],
        &executor,
    );
    let events = orch.subscribe();

    let report = orch.run().await.unwrap();
    let events = collect(events).await;

    let status = orch.status(&id("a")).unwrap();
    assert_eq!(status.state, TaskState::Failed);
    assert_eq!(status.attempts, 3);
    assert_eq!(status.previous_attempts, 2);
    let failure = status.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::ExecutorFailure);
    assert_eq!(failure.attempts, 3);

    assert_eq!(executor.calls_for("a"), 3);
    let attempts: Vec<u32> = executor.calls().iter().map(|c| c.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);

    let retrying = events
        .iter()
        .filter(|e| e.state == TaskState::Retrying)
        .count();
    assert_eq!(retrying, 2);
    assert_eq!(report.counts.failed_critical, 1);
}

/// Test: Transient failure recovers within the budget
#[tokio::test]
async fn test_transient_failure_recovers() {
    let executor = Arc::new(ScriptedExecutor::new().behave("a", Behavior::FailTimes(2)));
    let orch = orchestrator(
        vec![task("a").with_retry(RetryPolicy::fixed(3, Duration::from_millis(5)))],
        &executor,
    );

    let report = orch.run().await.unwrap();

    assert!(report.is_success());
    let status = orch.status(&id("a")).unwrap();
    assert_eq!(status.state, TaskState::Complete);
    assert_eq!(status.attempts, 3);
    assert_eq!(status.percent(), 100);
}

/// Test: Retry walks back through Queued
#[tokio::test]
async fn test_retry_requeues_task() {
    let executor = Arc::new(ScriptedExecutor::new().behave("a", Behavior::FailTimes(1)));
    let orch = orchestrator(
        vec![task("a").with_retry(RetryPolicy::fixed(2, Duration::from_millis(1)))],
        &executor,
    );
    let events = orch.subscribe();

    orch.run().await.unwrap();
    let events = collect(events).await;

    assert_eq!(
        states_for(&events, "a"),
        vec![
            TaskState::Queued,
            TaskState::Running,
            TaskState::Retrying,
            TaskState::Queued,
            TaskState::Running,
            TaskState::Verifying,
            TaskState::Complete,
        ]
    );
}

/// Test: Exponential backoff is capped
#[test]
fn test_exponential_backoff_capped() {
    let policy = RetryPolicy::exponential(
        10,
        Duration::from_millis(100),
        Duration::from_millis(1000),
    );
    let delays: Vec<Duration> = (1..=10).map(|n| policy.delay_for(n)).collect();

    assert_eq!(delays[0], Duration::from_millis(100));
    assert_eq!(delays[1], Duration::from_millis(200));
    assert_eq!(delays[3], Duration::from_millis(800));
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    assert!(delays.iter().all(|d| *d <= Duration::from_millis(1000)));
    assert_eq!(policy.delay_for(64), Duration::from_millis(1000));
}

/// Test: Timeout classification
/// Given an executor that never answers and a 50ms timeout
/// When the session runs
/// Then the task fails with kind Timeout and the executor is told to cancel
#[tokio::test]
async fn test_timeout_is_classified() {
    let executor = Arc::new(ScriptedExecutor::new().behave("a", Behavior::Hang));
    let orch = orchestrator(
        vec![task("a").with_timeout(Duration::from_millis(50))],
        &executor,
    );

    orch.run().await.unwrap();

    let failure = orch.status(&id("a")).unwrap().failure.unwrap();
    assert_eq!(failure.kind, FailureKind::Timeout);
    assert_eq!(executor.cancels(), 1);
}

/// Test: Broken dispatch channel counts as an executor failure
#[tokio::test]
async fn test_channel_error_is_retried() {
    let executor = Arc::new(ScriptedExecutor::new().behave("a", Behavior::ChannelError));
    let orch = orchestrator(
        vec![task("a").with_retry(RetryPolicy::fixed(2, Duration::from_millis(1)))],
        &executor,
    );

    orch.run().await.unwrap();

    let status = orch.status(&id("a")).unwrap();
    assert_eq!(status.attempts, 2);
    assert_eq!(status.failure.unwrap().kind, FailureKind::ExecutorFailure);
}

/// Test: Missing executor fails without retrying
#[tokio::test]
async fn test_missing_executor_not_retried() {
    let executor = Arc::new(ScriptedExecutor::new());
    let orch = orchestrator(
        vec![Task::new("rustup", ExecutorKind::Toolchain, "install")
            .with_retry(RetryPolicy::fixed(3, Duration::from_millis(1)))],
        &executor,
    );

    orch.run().await.unwrap();

    let status = orch.status(&id("rustup")).unwrap();
    assert_eq!(status.state, TaskState::Failed);
    assert_eq!(status.attempts, 1);
    assert!(executor.calls().is_empty());
}

fn verified_task() -> Task {
    task("git")
        .with_verification(VerificationStep::new(
            "binary",
            "command -v git",
            Expectation::Contains("/usr/bin/git".into()),
        ))
        .with_verification(VerificationStep::new(
            "version",
            "git --version",
            Expectation::Matches(r"^git version 2\.\d+".into()),
        ))
}

/// Test: Two verification steps, both pass
#[tokio::test]
async fn test_verification_steps_pass() {
    let executor = Arc::new(ScriptedExecutor::new().behave(
        "git",
        Behavior::Probes(vec![
            ("binary", "/usr/bin/git\n"),
            ("version", "git version 2.43.0\n"),
        ]),
    ));
    let orch = orchestrator(vec![verified_task()], &executor);

    orch.run().await.unwrap();

    let status = orch.status(&id("git")).unwrap();
    assert_eq!(status.state, TaskState::Complete);
    let execution = status.execution.unwrap();
    assert_eq!(execution.verification.len(), 2);
    assert!(execution.verification.iter().all(|r| r.passed));
}

/// Test: Second of two verification steps fails
/// Given a task with two steps where only the first passes
/// When the action succeeds
/// Then the task fails with VerificationFailure and both results are kept
#[tokio::test]
async fn test_second_verification_step_fails() {
    let executor = Arc::new(ScriptedExecutor::new().behave(
        "git",
        Behavior::Probes(vec![
            ("binary", "/usr/bin/git\n"),
            ("version", "git version 1.8.0\n"),
        ]),
    ));
    let orch = orchestrator(vec![verified_task()], &executor);

    let report = orch.run().await.unwrap();

    let status = orch.status(&id("git")).unwrap();
    assert_eq!(status.state, TaskState::Failed);
    let failure = status.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::VerificationFailure);
    assert_eq!(failure.verification.len(), 2);
    assert!(failure.verification[0].passed);
    assert!(!failure.verification[1].passed);
    assert!(failure.message.contains("version"));
    assert_eq!(report.failed.len(), 1);
}

/// Test: Without a probe result, a step is checked against the action output
#[tokio::test]
async fn test_verification_falls_back_to_output() {
    let executor = Arc::new(ScriptedExecutor::new());
    let orch = orchestrator(
        vec![task("a").with_verification(VerificationStep::new(
            "echo",
            "n/a",
            Expectation::Equals("ok a".into()),
        ))],
        &executor,
    );

    let report = orch.run().await.unwrap();

    assert!(report.is_success());
}

/// Test: First of two verification steps fails
/// Given a task whose first check fails and second passes
/// When the action succeeds
/// Then the first failure is reported and the second result is still present
#[tokio::test]
async fn test_first_verification_step_fails() {
    let executor = Arc::new(ScriptedExecutor::new().behave(
        "git",
        Behavior::Probes(vec![
            ("binary", "git not found\n"),
            ("version", "git version 2.43.0\n"),
        ]),
    ));
    let orch = orchestrator(vec![verified_task()], &executor);

    orch.run().await.unwrap();

    let failure = orch.status(&id("git")).unwrap().failure.unwrap();
    assert_eq!(failure.kind, FailureKind::VerificationFailure);
    assert!(failure.message.contains("binary"));
    assert_eq!(failure.verification.len(), 2);
    assert!(!failure.verification[0].passed);
    assert!(failure.verification[1].passed);
    assert_eq!(failure.verification[1].step, "version");
}
