//! Task lifecycle: states, per-attempt execution records, and the state
//! machine that drives one task through a session.

mod machine;
mod record;
mod state;

pub use machine::{AttemptFailure, AttemptOutcome, ExecutionSnapshot, TaskStateMachine};
pub use record::{Execution, FailureDetail, FailureKind, SessionId, MAX_OUTPUT_BYTES};
pub use state::{TaskState, TransitionEntry};
