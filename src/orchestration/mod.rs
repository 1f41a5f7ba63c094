//! Orchestration layer.
//!
//! The [`Orchestrator`] schedules tasks from the dependency graph, drives
//! each task's state machine through dispatch and verification, and
//! publishes progress on the event bus. An optional [`Advisor`] is consulted
//! when a task fails for good.

mod advisor;
mod check;
mod manager;
mod report;

pub use advisor::{Advisor, AdvisorConfig, PatternAdvisor};
pub use check::{CheckItem, CheckStatus, Inventory, InventoryReport};
pub use manager::{
    Orchestrator, OrchestratorBuilder, OrchestratorConfig, DEFAULT_CONCURRENCY,
    DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_TICK_INTERVAL_MS,
};
pub use report::{BlockedTask, FailedTask, SessionRecord, SessionReport, StateCounts, TaskRecord};
