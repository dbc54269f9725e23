//! Dependency-graph scheduler and agent coordinator.

mod coordinator;
mod handler;
mod plan;
mod signal;
mod status;

pub use coordinator::AgentCoordinator;
pub use handler::{agent_loader_fn, task_handler_fn, AgentLoader, TaskContext, TaskHandler};
pub use plan::{Task, TaskPlan};
pub use signal::{Signal, SignalHandler};
pub use status::{ExecutionReport, ExecutionState, ExecutionStatus, TaskRecord, TaskState};
