//! Core domain models for provisioning orchestration.
//!
//! This module contains the fundamental data structures used throughout
//! the orchestration engine: tasks, retry policies and the dependency graph.

pub mod dag;
pub mod retry;
pub mod task;

pub use dag::DependencyGraph;
pub use retry::{Backoff, RetryPolicy};
pub use task::{ExecutorKind, Task, TaskId};
