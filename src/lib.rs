//! Multi-agent coordination runtime.
//!
//! Independent agent workers communicate only through a shared event bus and
//! are driven toward completion by a dependency-aware task scheduler and a
//! build/test/fix/verify iteration state machine. The bus is single-process
//! and in-memory, with optional local disk persistence for recovery.

pub mod bus;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod iteration;
pub mod persistence;
pub mod progress;
pub mod runtime;
pub mod scheduler;

pub use bus::{
    handler_fn, BusStats, EventBus, EventHandler, HistoryFilter, Message, MessageId, Priority,
    PublishOptions, RequestId, SubscriptionId,
};
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use config::{ConvoyConfig, StoreBackend};
pub use error::{ConvoyError, Result};
pub use iteration::{
    BlockerSeverity, EscalationLevel, Iteration, IterationId, IterationManager, IterationOptions,
    IterationPhase, PhaseExecutor, PhaseOutcome,
};
pub use persistence::{MemoryStore, SnapshotStore, SqliteStore, StateSnapshot, StateStore};
pub use progress::{ProgressSnapshot, ProgressTracker, ProgressTrend};
pub use runtime::{ConvoyRuntime, RuntimeBuilder};
pub use scheduler::{
    agent_loader_fn, task_handler_fn, AgentCoordinator, AgentLoader, ExecutionReport,
    ExecutionState, ExecutionStatus, Task, TaskContext, TaskHandler, TaskPlan, TaskRecord,
    TaskState,
};
