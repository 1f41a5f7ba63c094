//! Orchestrator side of the dispatch protocol.
//!
//! The [`Dispatcher`] resolves the executor for a command, guarantees at
//! most one outstanding command per execution id, forwards progress in send
//! order, and enforces the command timeout without relying on the executor.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dispatch::executor::ProgressSink;
use crate::dispatch::protocol::{DispatchCommand, DispatchResult, ExecutionId, ProgressMessage};
use crate::dispatch::registry::ExecutorRegistry;
use crate::{Error, Result};

type Outstanding = Arc<Mutex<HashSet<ExecutionId>>>;

/// RAII claim on an execution id.
///
/// Holding the guard marks the command as outstanding; dropping it (on any
/// exit path) releases the id.
struct OutstandingGuard {
    outstanding: Outstanding,
    execution_id: ExecutionId,
}

impl OutstandingGuard {
    fn claim(outstanding: &Outstanding, execution_id: ExecutionId) -> Result<Self> {
        let mut set = outstanding.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(execution_id) {
            return Err(Error::DuplicateDispatch(execution_id));
        }
        Ok(Self {
            outstanding: Arc::clone(outstanding),
            execution_id,
        })
    }
}

impl Drop for OutstandingGuard {
    fn drop(&mut self) {
        let mut set = self.outstanding.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.execution_id);
    }
}

/// Sends commands to executors and waits for their terminal result.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ExecutorRegistry>,
    outstanding: Outstanding,
}

impl Dispatcher {
    pub fn new(registry: ExecutorRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            outstanding: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    /// Whether a command for the execution is in flight.
    pub fn is_outstanding(&self, execution_id: &ExecutionId) -> bool {
        self.outstanding
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(execution_id)
    }

    /// Number of commands in flight.
    pub fn outstanding_count(&self) -> usize {
        self.outstanding
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Dispatch a command and wait for its terminal result.
    ///
    /// `on_progress` is called for each progress message, in send order,
    /// and never after this future resolves.
    ///
    /// # Errors
    /// - `DuplicateDispatch` if the execution already has a command in flight
    /// - `NoExecutor` if no executor serves the command's kind
    /// - `Timeout` if no result arrives within `command.timeout`
    /// - `Cancelled` if `cancel` fires first
    /// - `ExecutorFailure` if the executor's channel fails or answers for
    ///   another execution
    ///
    /// On timeout or cancellation the executor is sent a best-effort cancel.
    pub async fn dispatch<F>(
        &self,
        command: DispatchCommand,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<DispatchResult>
    where
        F: FnMut(ProgressMessage) + Send,
    {
        let execution_id = command.execution_id;
        let _guard = OutstandingGuard::claim(&self.outstanding, execution_id)?;
        let executor = self.registry.get(command.executor)?;
        let timeout = command.timeout;

        debug!(
            execution = %execution_id.short(),
            executor = %command.executor,
            action = %command.action,
            attempt = command.attempt,
            "dispatching command"
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = ProgressSink::new(execution_id, tx);
        let mut pending = executor.execute(command, sink);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(Error::Cancelled),
                Some(msg) = rx.recv() => on_progress(msg),
                result = &mut pending => {
                    while let Ok(msg) = rx.try_recv() {
                        on_progress(msg);
                    }
                    break match result {
                        Ok(result) if result.execution_id != execution_id => {
                            Err(Error::ExecutorFailure(format!(
                                "result for execution {} answered command {}",
                                result.execution_id, execution_id
                            )))
                        }
                        Ok(result) => Ok(result),
                        Err(Error::ExecutorFailure(msg)) => Err(Error::ExecutorFailure(msg)),
                        Err(e) => Err(Error::ExecutorFailure(e.to_string())),
                    };
                }
                _ = &mut deadline => break Err(Error::Timeout(timeout)),
            }
        };
        drop(pending);

        if matches!(outcome, Err(Error::Cancelled) | Err(Error::Timeout(_))) {
            warn!(
                execution = %execution_id.short(),
                "command abandoned, sending best-effort cancel"
            );
            executor.cancel(execution_id).await;
        }
        outcome
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("outstanding", &self.outstanding_count())
            .finish()
    }
}
