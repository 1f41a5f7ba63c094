pub mod config;
pub mod core;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod execution;
pub mod log;
pub mod orchestration;
pub mod plan;
pub mod store;
pub mod util;
pub mod verification;

pub use error::{Error, Result};
pub use events::{EventBus, EventStream, ProgressEvent};
pub use execution::{SessionId, TaskState};
pub use orchestration::{
    Inventory, InventoryReport, Orchestrator, OrchestratorConfig, SessionRecord, SessionReport,
};
pub use plan::Plan;
pub use store::SessionStore;
