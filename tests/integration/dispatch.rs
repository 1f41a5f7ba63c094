//! Dispatch protocol integration tests.
//!
//! These tests exercise the dispatcher directly against the scripted
//! executor: one outstanding command per execution, timeouts and ordered
//! progress delivery.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

use provisor::core::ExecutorKind;
use provisor::dispatch::{CommandMode, DispatchCommand, Dispatcher, ExecutionId};
use provisor::Error;

use crate::fixtures::{registry, Behavior, ScriptedExecutor};

fn command(execution_id: ExecutionId, action: &str, timeout: Duration) -> DispatchCommand {
    DispatchCommand {
        execution_id,
        executor: ExecutorKind::Shell,
        action: action.to_string(),
        params: BTreeMap::new(),
        timeout,
        verification: Vec::new(),
        attempt: 1,
        mode: CommandMode::Apply,
    }
}

/// Test: Duplicate dispatch
/// Given a command outstanding for an execution
/// When a second command is dispatched for the same execution
/// Then it is rejected without reaching the executor
#[tokio::test]
async fn test_duplicate_dispatch_rejected() {
    let executor = Arc::new(ScriptedExecutor::new().behave("hang", Behavior::Hang));
    let dispatcher = Dispatcher::new(registry(&executor));
    let execution_id = ExecutionId::new();
    let token = CancellationToken::new();

    let first = {
        let dispatcher = dispatcher.clone();
        let token = token.clone();
        tokio::spawn(async move {
            dispatcher
                .dispatch(
                    command(execution_id, "hang", Duration::from_secs(30)),
                    &token,
                    |_| {},
                )
                .await
        })
    };
    while !dispatcher.is_outstanding(&execution_id) {
        tokio::task::yield_now().await;
    }

    let second = dispatcher
        .dispatch(
            command(execution_id, "other", Duration::from_secs(30)),
            &CancellationToken::new(),
            |_| {},
        )
        .await;
    assert!(matches!(second, Err(Error::DuplicateDispatch(id)) if id == execution_id));
    assert_eq!(executor.calls_for("other"), 0);

    token.cancel();
    assert!(matches!(first.await.unwrap(), Err(Error::Cancelled)));
    assert!(!dispatcher.is_outstanding(&execution_id));
    assert_eq!(dispatcher.outstanding_count(), 0);

    // The id is free again once the first command settled.
    let third = dispatcher
        .dispatch(
            command(execution_id, "other", Duration::from_secs(30)),
            &CancellationToken::new(),
            |_| {},
        )
        .await;
    let result = assert_ok!(third);
    assert!(result.success);
}

/// Test: Timeout abandons the command and tells the executor
#[tokio::test]
async fn test_timeout_sends_best_effort_cancel() {
    let executor = Arc::new(ScriptedExecutor::new().behave("hang", Behavior::Hang));
    let dispatcher = Dispatcher::new(registry(&executor));

    let result = dispatcher
        .dispatch(
            command(ExecutionId::new(), "hang", Duration::from_millis(20)),
            &CancellationToken::new(),
            |_| {},
        )
        .await;

    assert!(matches!(result, Err(Error::Timeout(d)) if d == Duration::from_millis(20)));
    assert_eq!(executor.cancels(), 1);
    assert_eq!(dispatcher.outstanding_count(), 0);
}

/// Test: Progress arrives in send order before the result
#[tokio::test]
async fn test_progress_delivered_in_order() {
    let executor = Arc::new(ScriptedExecutor::new());
    let dispatcher = Dispatcher::new(registry(&executor));
    let mut seen = Vec::new();

    let result = dispatcher
        .dispatch(
            command(ExecutionId::new(), "install", Duration::from_secs(5)),
            &CancellationToken::new(),
            |msg| seen.push((msg.seq, msg.percent, msg.message)),
        )
        .await;

    assert_ok!(result);
    assert_eq!(
        seen,
        vec![(0, 10, "starting".to_string()), (1, 50, "working".to_string())]
    );
}

/// Test: Unregistered executor kind
#[tokio::test]
async fn test_no_executor_for_kind() {
    let executor = Arc::new(ScriptedExecutor::new());
    let dispatcher = Dispatcher::new(registry(&executor));
    let mut cmd = command(ExecutionId::new(), "install", Duration::from_secs(5));
    cmd.executor = ExecutorKind::Windows;

    let result = dispatcher
        .dispatch(cmd, &CancellationToken::new(), |_| {})
        .await;

    assert!(matches!(result, Err(Error::NoExecutor(_))));
    assert_eq!(dispatcher.outstanding_count(), 0);
}
