//! Scheduling integration tests.
//!
//! These tests verify dependency ordering, readiness computation and the
//! bound on concurrently dispatched tasks.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use provisor::core::{DependencyGraph, RetryPolicy};
use provisor::execution::TaskState;
use provisor::orchestration::OrchestratorConfig;
use provisor::{Error, Orchestrator};

use crate::fixtures::{
    collect, fast_config, id, orchestrator, orchestrator_with, position, registry, states_for,
    task, wait_for, Behavior, ScriptedExecutor,
};

/// Test: Readiness is a pure function of the completed set
/// Given a graph and an unchanged completed set
/// When ready is computed twice
/// Then both results are identical
#[test]
fn test_ready_is_repeatable() {
    let graph = DependencyGraph::build(vec![
        task("a"),
        task("b").depends_on("a"),
        task("c"),
        task("d").depends_on("b").depends_on("c"),
    ])
    .unwrap();

    let mut completed = HashSet::new();
    let first: Vec<_> = graph.ready(&completed).iter().map(|t| t.id().clone()).collect();
    let second: Vec<_> = graph.ready(&completed).iter().map(|t| t.id().clone()).collect();
    assert_eq!(first, second);
    assert_eq!(first, vec![id("a"), id("c")]);

    completed.insert(id("a"));
    completed.insert(id("c"));
    let ready: Vec<_> = graph.ready(&completed).iter().map(|t| t.id().clone()).collect();
    assert_eq!(ready, vec![id("b")]);
}

/// Test: Cycles are rejected before anything runs
/// Given tasks a -> b -> c -> a
/// When the orchestrator is built
/// Then CycleDetected names the cycle
#[test]
fn test_cycle_rejected_at_build() {
    let executor = Arc::new(ScriptedExecutor::new());
    let result = Orchestrator::builder(
        vec![
            task("a").depends_on("c"),
            task("b").depends_on("a"),
            task("c").depends_on("b"),
        ],
        registry(&executor),
    )
    .build();

    match result {
        Err(Error::CycleDetected { cycle }) => assert!(cycle.len() >= 3),
        other => panic!("expected CycleDetected, got {:?}", other),
    }
    assert!(executor.calls().is_empty());
}

/// Test: Unknown prerequisites are rejected
#[test]
fn test_unknown_prerequisite_rejected() {
    let executor = Arc::new(ScriptedExecutor::new());
    let result = Orchestrator::builder(vec![task("a").depends_on("ghost")], registry(&executor))
        .build();
    assert!(matches!(result, Err(Error::UnknownPrerequisite { .. })));
}

/// Test: Two-task chain
/// Given tasks A and B where B depends on A
/// When both succeed
/// Then both complete and B is queued only after A completes
#[tokio::test]
async fn test_two_task_chain_succeeds() {
    let executor = Arc::new(ScriptedExecutor::new());
    let orch = orchestrator(vec![task("a"), task("b").depends_on("a")], &executor);
    let events = orch.subscribe();

    let report = orch.run().await.unwrap();
    let events = collect(events).await;

    assert!(report.is_success());
    assert_eq!(report.completed, vec![id("a"), id("b")]);
    assert_eq!(report.completion_percentage(), 100.0);
    assert_eq!(executor.actions(), vec!["a", "b"]);

    let a_complete = position(&events, "a", TaskState::Complete).unwrap();
    let b_queued = position(&events, "b", TaskState::Queued).unwrap();
    assert!(a_complete < b_queued);
}

/// Test: Diamond join
/// Given a -> {b, c} -> d
/// When the session runs
/// Then d starts only after both b and c complete
#[tokio::test]
async fn test_diamond_join_waits_for_both_branches() {
    let executor = Arc::new(
        ScriptedExecutor::new()
            .behave("b", Behavior::Sleep(Duration::from_millis(30)))
            .behave("c", Behavior::Sleep(Duration::from_millis(10))),
    );
    let orch = orchestrator(
        vec![
            task("a"),
            task("b").depends_on("a"),
            task("c").depends_on("a"),
            task("d").depends_on("b").depends_on("c"),
        ],
        &executor,
    );
    let events = orch.subscribe();

    let report = orch.run().await.unwrap();
    let events = collect(events).await;

    assert_eq!(report.counts.complete, 4);
    let d_queued = position(&events, "d", TaskState::Queued).unwrap();
    assert!(position(&events, "b", TaskState::Complete).unwrap() < d_queued);
    assert!(position(&events, "c", TaskState::Complete).unwrap() < d_queued);
    assert_eq!(executor.actions().last().map(String::as_str), Some("d"));
}

/// Test: Worker pool bound
/// Given six independent slow tasks and a concurrency of two
/// When the session runs
/// Then no more than two are dispatched at once
#[tokio::test]
async fn test_concurrency_limit_respected() {
    let mut executor = ScriptedExecutor::new();
    let names = ["t1", "t2", "t3", "t4", "t5", "t6"];
    for name in names {
        executor = executor.behave(name, Behavior::Sleep(Duration::from_millis(20)));
    }
    let executor = Arc::new(executor);
    let config = OrchestratorConfig {
        concurrency: 2,
        ..fast_config()
    };
    let orch = orchestrator_with(names.iter().map(|n| task(n)).collect(), &executor, config, None);

    let report = orch.run().await.unwrap();

    assert_eq!(report.counts.complete, 6);
    assert!(executor.max_concurrent() <= 2);
    assert_eq!(executor.calls().len(), 6);
}

/// Test: A task waiting out its backoff holds no worker
/// Given a single worker, a task with a long retry backoff and an independent task
/// When the first task fails and waits to retry
/// Then the independent task runs to completion in the meantime
#[tokio::test]
async fn test_backoff_does_not_hold_worker() {
    let executor = Arc::new(ScriptedExecutor::new().behave("a", Behavior::Fail("exit 1")));
    let config = OrchestratorConfig {
        concurrency: 1,
        ..fast_config()
    };
    let orch = orchestrator_with(
        vec![
            task("a").with_retry(RetryPolicy::fixed(2, Duration::from_secs(30))),
            task("b"),
        ],
        &executor,
        config,
        None,
    );
    let mut events = orch.subscribe();

    let runner = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.run().await })
    };
    wait_for(&mut events, "a", TaskState::Retrying).await;
    wait_for(&mut events, "b", TaskState::Complete).await;

    assert_eq!(orch.status(&id("a")).unwrap().state, TaskState::Retrying);
    assert_eq!(executor.actions(), vec!["a".to_string(), "b".to_string()]);

    orch.shutdown();
    let report = runner.await.unwrap().unwrap();
    assert_eq!(report.completed, vec![id("b")]);
    assert_eq!(report.cancelled, vec![id("a")]);
}

/// Test: Independent tasks overlap
#[tokio::test]
async fn test_independent_tasks_run_in_parallel() {
    let executor = Arc::new(
        ScriptedExecutor::new()
            .behave("x", Behavior::Sleep(Duration::from_millis(50)))
            .behave("y", Behavior::Sleep(Duration::from_millis(50))),
    );
    let orch = orchestrator(vec![task("x"), task("y")], &executor);

    orch.run().await.unwrap();

    assert_eq!(executor.max_concurrent(), 2);
}

/// Test: Every transition of a successful task is published in order
#[tokio::test]
async fn test_lifecycle_states_published() {
    let executor = Arc::new(ScriptedExecutor::new());
    let orch = orchestrator(vec![task("a")], &executor);
    let events = orch.subscribe();

    orch.run().await.unwrap();
    let events = collect(events).await;

    assert_eq!(
        states_for(&events, "a"),
        vec![
            TaskState::Queued,
            TaskState::Running,
            TaskState::Verifying,
            TaskState::Complete
        ]
    );
}

/// Test: An empty plan finishes at once
#[tokio::test]
async fn test_empty_session_finishes_immediately() {
    let executor = Arc::new(ScriptedExecutor::new());
    let orch = orchestrator(Vec::new(), &executor);

    let report = orch.run().await.unwrap();

    assert_eq!(report.total, 0);
    assert_eq!(report.completion_percentage(), 0.0);
    assert!(report.is_success());
    assert!(orch.is_closed());
}
