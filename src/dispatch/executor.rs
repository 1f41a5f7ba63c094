//! The executor side of the dispatch protocol.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core::ExecutorKind;
use crate::dispatch::protocol::{DispatchCommand, DispatchResult, ExecutionId, ProgressMessage};
use crate::Result;

/// A remote capability that performs tasks of one [`ExecutorKind`].
///
/// Implementations stream progress through the [`ProgressSink`] and return
/// the terminal result. Returning `Err` means the dispatch channel itself
/// failed; a task-level failure is `Ok` with `success == false`.
#[async_trait]
pub trait Executor: Send + Sync {
    fn kind(&self) -> ExecutorKind;

    async fn execute(&self, command: DispatchCommand, progress: ProgressSink)
        -> Result<DispatchResult>;

    /// Best-effort cancellation of an outstanding command.
    async fn cancel(&self, _execution_id: ExecutionId) {}
}

/// Ordered progress channel handed to an executor for one execution.
///
/// Sequence numbers are assigned here so the stream is gap free.
#[derive(Debug)]
pub struct ProgressSink {
    execution_id: ExecutionId,
    seq: u64,
    tx: mpsc::UnboundedSender<ProgressMessage>,
}

impl ProgressSink {
    pub fn new(execution_id: ExecutionId, tx: mpsc::UnboundedSender<ProgressMessage>) -> Self {
        Self {
            execution_id,
            seq: 0,
            tx,
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    /// Report a percentage and message. Returns false once nobody listens.
    pub fn report(&mut self, percent: u8, message: &str) -> bool {
        self.send(percent, message, None)
    }

    /// Report progress carrying a fragment of captured output.
    pub fn output(&mut self, percent: u8, message: &str, fragment: &str) -> bool {
        self.send(percent, message, Some(fragment.to_string()))
    }

    fn send(&mut self, percent: u8, message: &str, output: Option<String>) -> bool {
        let msg = ProgressMessage {
            execution_id: self.execution_id,
            seq: self.seq,
            percent: percent.min(100),
            message: message.to_string(),
            output,
        };
        self.seq += 1;
        self.tx.send(msg).is_ok()
    }
}
