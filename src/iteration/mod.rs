//! Iteration control: the build/test/fix/verify state machine with bounded
//! retries, bounded fix attempts, and terminal escalation.

mod blocker;
mod executor;
mod manager;
mod phase;
mod types;

pub use blocker::{Blocker, BlockerRegistry, BlockerSeverity};
pub use executor::{
    BusPhaseExecutor, PhaseExecutor, PHASE_BUILD_EVENT, PHASE_FIX_EVENT, PHASE_TEST_EVENT,
};
pub use manager::IterationManager;
pub use phase::IterationPhase;
pub use types::{
    EscalationLevel, Iteration, IterationId, IterationOptions, IterationStatus, PhaseOutcome,
};
