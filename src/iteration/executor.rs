//! Phase executors: how build/test/fix work actually runs.
//!
//! The default executor dispatches each phase as a bus request, so domain
//! agents answer phases by subscribing to `phase.*` events and calling
//! `respond()` — no direct calls into the iteration layer.

use std::time::Duration;

use async_trait::async_trait;

use super::types::{Iteration, PhaseOutcome};
use crate::bus::EventBus;
use crate::error::Result;

pub const PHASE_BUILD_EVENT: &str = "phase.build";
pub const PHASE_TEST_EVENT: &str = "phase.test";
pub const PHASE_FIX_EVENT: &str = "phase.fix";

#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    async fn build(&self, iteration: &Iteration) -> Result<PhaseOutcome>;

    async fn test(&self, iteration: &Iteration) -> Result<PhaseOutcome>;

    async fn fix(&self, iteration: &Iteration) -> Result<PhaseOutcome>;
}

/// Executor that turns each phase into a `request()` on the bus.
pub struct BusPhaseExecutor {
    bus: EventBus,
    timeout: Duration,
}

impl BusPhaseExecutor {
    pub fn new(bus: EventBus, timeout: Duration) -> Self {
        Self { bus, timeout }
    }

    async fn dispatch(&self, event_type: &str, iteration: &Iteration) -> Result<PhaseOutcome> {
        let payload = serde_json::json!({
            "iteration_id": iteration.id.to_string(),
            "plan_id": iteration.plan_id,
            "retry_count": iteration.retry_count,
            "fix_attempts": iteration.fix_attempts,
            "errors": iteration.errors,
            "failed_tests": iteration.failed_tests,
        });
        let response = self
            .bus
            .request(event_type, payload, Some(self.timeout))
            .await?;
        Ok(PhaseOutcome::from_response(response))
    }
}

#[async_trait]
impl PhaseExecutor for BusPhaseExecutor {
    async fn build(&self, iteration: &Iteration) -> Result<PhaseOutcome> {
        self.dispatch(PHASE_BUILD_EVENT, iteration).await
    }

    async fn test(&self, iteration: &Iteration) -> Result<PhaseOutcome> {
        self.dispatch(PHASE_TEST_EVENT, iteration).await
    }

    async fn fix(&self, iteration: &Iteration) -> Result<PhaseOutcome> {
        self.dispatch(PHASE_FIX_EVENT, iteration).await
    }
}
