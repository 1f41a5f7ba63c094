//! Dispatch protocol between the orchestrator and remote executors.
//!
//! Executors are addressed by [`ExecutorKind`](crate::core::ExecutorKind)
//! through an [`ExecutorRegistry`]; the [`Dispatcher`] owns the
//! orchestrator side of the exchange.

mod dispatcher;
mod executor;
mod process;
mod protocol;
mod registry;

pub use dispatcher::Dispatcher;
pub use executor::{Executor, ProgressSink};
pub use process::{ProcessExecutor, COMMAND_PARAM};
pub use protocol::{
    CommandMode, DispatchCommand, DispatchResult, ExecutionId, ProgressMessage, RemediationAction,
    RemediationHint,
};
pub use registry::ExecutorRegistry;
