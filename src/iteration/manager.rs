//! Iteration manager: drives build/test/fix/verify cycles, bounds retries
//! and fix attempts, and escalates unrecoverable failures.
//!
//! Every phase transition is published on the bus so other agents and
//! observability consumers can react without polling.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use super::blocker::{Blocker, BlockerRegistry, BlockerSeverity};
use super::executor::{BusPhaseExecutor, PhaseExecutor};
use super::phase::IterationPhase;
use super::types::{
    EscalationLevel, Iteration, IterationId, IterationOptions, IterationStatus, PhaseOutcome,
};
use crate::bus::{EventBus, Priority, PublishOptions};
use crate::config::IterationConfig;
use crate::error::{ConvoyError, Result};

pub struct IterationManager {
    bus: EventBus,
    executor: Arc<dyn PhaseExecutor>,
    iterations: DashMap<IterationId, Iteration>,
    blockers: Arc<BlockerRegistry>,
    config: IterationConfig,
}

impl IterationManager {
    pub fn new(bus: EventBus, config: IterationConfig) -> Self {
        let executor = Arc::new(BusPhaseExecutor::new(
            bus.clone(),
            std::time::Duration::from_millis(config.phase_timeout_ms),
        ));
        Self {
            bus,
            executor,
            iterations: DashMap::new(),
            blockers: Arc::new(BlockerRegistry::new()),
            config,
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn PhaseExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_blockers(mut self, blockers: Arc<BlockerRegistry>) -> Self {
        self.blockers = blockers;
        self
    }

    pub async fn start_iteration(
        &self,
        plan_id: impl Into<String>,
        options: Option<IterationOptions>,
    ) -> IterationId {
        let options = options.unwrap_or_else(|| IterationOptions::from(&self.config));
        let iteration = Iteration::new(plan_id, options);
        let id = iteration.id;

        self.emit(
            "iteration.started",
            serde_json::json!({
                "iteration_id": id.to_string(),
                "plan_id": iteration.plan_id,
                "max_retries": options.max_retries,
                "max_fix_attempts": options.max_fix_attempts,
            }),
        )
        .await;

        info!(iteration_id = %id, plan_id = iteration.plan_id, "Iteration started");
        self.iterations.insert(id, iteration);
        id
    }

    pub fn get_iteration(&self, id: IterationId) -> Option<Iteration> {
        self.iterations.get(&id).map(|e| e.value().clone())
    }

    /// Run one build attempt. Failure retries the phase; exhausting
    /// `max_retries` escalates.
    pub async fn run_build_phase(&self, id: IterationId) -> Result<PhaseOutcome> {
        let iteration = self.require_phase(id, IterationPhase::Build)?;
        self.emit_phase(&iteration, IterationPhase::Build, "started").await;

        let outcome = self.run_executor_phase(IterationPhase::Build, &iteration).await;
        if outcome.success {
            let updated = self.update(id, |it| it.transition(IterationPhase::Test))?;
            self.emit_phase(&updated, IterationPhase::Build, "completed").await;
            return Ok(outcome);
        }

        let updated = self.update(id, |it| {
            it.record_failure(&outcome);
            it.retry_count += 1;
            Ok(())
        })?;
        self.emit_phase(&updated, IterationPhase::Build, "failed").await;

        if updated.retry_count >= updated.options.max_retries {
            self.escalate(id, "Build retries exhausted").await?;
            return Err(ConvoyError::Escalation {
                summary: format!("Iteration {} exhausted build retries", id),
            });
        }
        Ok(outcome)
    }

    /// Run the test phase. Failing tests route to `Fix`; an executor error
    /// retries the phase, bounded by `max_retries`.
    pub async fn run_test_phase(&self, id: IterationId) -> Result<PhaseOutcome> {
        let iteration = self.require_phase(id, IterationPhase::Test)?;
        self.emit_phase(&iteration, IterationPhase::Test, "started").await;

        match self.executor.test(&iteration).await {
            Ok(outcome) if outcome.success => {
                let updated = self.update(id, |it| it.transition(IterationPhase::Complete))?;
                self.emit_phase(&updated, IterationPhase::Test, "completed").await;
                self.emit_completed(&updated).await;
                Ok(outcome)
            }
            Ok(outcome) => {
                let updated = self.update(id, |it| {
                    it.record_failure(&outcome);
                    it.transition(IterationPhase::Fix)
                })?;
                self.emit_phase(&updated, IterationPhase::Test, "failed").await;
                Ok(outcome)
            }
            Err(e) => {
                let outcome = PhaseOutcome::failed(vec![e.to_string()]);
                let updated = self.update(id, |it| {
                    it.record_failure(&outcome);
                    it.retry_count += 1;
                    Ok(())
                })?;
                self.emit_phase(&updated, IterationPhase::Test, "failed").await;
                if updated.retry_count >= updated.options.max_retries {
                    self.escalate(id, "Test retries exhausted").await?;
                    return Err(ConvoyError::Escalation {
                        summary: format!("Iteration {} exhausted test retries", id),
                    });
                }
                Ok(outcome)
            }
        }
    }

    /// Run one fix attempt. Each call increments `fix_attempts` by exactly
    /// one; a call with the budget already spent escalates instead.
    pub async fn run_fix_phase(&self, id: IterationId) -> Result<PhaseOutcome> {
        let iteration = self.require_phase(id, IterationPhase::Fix)?;

        if !iteration.fix_attempts_remaining() {
            self.escalate(id, "Fix attempts exhausted").await?;
            return Err(ConvoyError::Escalation {
                summary: format!("Iteration {} exhausted fix attempts", id),
            });
        }

        let iteration = self.update(id, |it| {
            it.fix_attempts += 1;
            Ok(())
        })?;
        self.emit_phase(&iteration, IterationPhase::Fix, "started").await;

        let outcome = self.run_executor_phase(IterationPhase::Fix, &iteration).await;
        if outcome.success {
            let updated = self.update(id, |it| it.transition(IterationPhase::Verify))?;
            self.emit_phase(&updated, IterationPhase::Fix, "completed").await;
        } else {
            let updated = self.update(id, |it| {
                it.record_failure(&outcome);
                Ok(())
            })?;
            self.emit_phase(&updated, IterationPhase::Fix, "failed").await;
        }
        Ok(outcome)
    }

    /// Re-run tests after a fix. Success completes the iteration; failure
    /// re-enters `Fix` while attempts remain, otherwise escalates.
    pub async fn run_verify_phase(&self, id: IterationId) -> Result<PhaseOutcome> {
        let iteration = self.require_phase(id, IterationPhase::Verify)?;
        self.emit_phase(&iteration, IterationPhase::Verify, "started").await;

        let outcome = match self.executor.test(&iteration).await {
            Ok(outcome) => outcome,
            Err(e) => PhaseOutcome::failed(vec![e.to_string()]),
        };

        if outcome.success {
            let updated = self.update(id, |it| it.transition(IterationPhase::Complete))?;
            self.emit_phase(&updated, IterationPhase::Verify, "completed").await;
            self.emit_completed(&updated).await;
            return Ok(outcome);
        }

        let updated = self.update(id, |it| {
            it.record_failure(&outcome);
            Ok(())
        })?;
        self.emit_phase(&updated, IterationPhase::Verify, "failed").await;

        if updated.fix_attempts_remaining() {
            self.update(id, |it| it.transition(IterationPhase::Fix))?;
            Ok(outcome)
        } else {
            self.escalate(id, "Verify failed with fix attempts exhausted")
                .await?;
            Err(ConvoyError::Escalation {
                summary: format!("Iteration {} failed verification after {} fixes", id, updated.fix_attempts),
            })
        }
    }

    /// Drive the iteration to a terminal phase. Escalation is reported via
    /// the returned iteration's status, not as an error.
    pub async fn run_full_cycle(&self, id: IterationId) -> Result<Iteration> {
        loop {
            let iteration = self
                .get_iteration(id)
                .ok_or_else(|| ConvoyError::IterationNotFound(id.to_string()))?;
            if iteration.status.is_terminal() {
                return Ok(iteration);
            }

            let step = match iteration.phase {
                IterationPhase::Build => self.run_build_phase(id).await,
                IterationPhase::Test => self.run_test_phase(id).await,
                IterationPhase::Fix => self.run_fix_phase(id).await,
                IterationPhase::Verify => self.run_verify_phase(id).await,
                IterationPhase::Complete | IterationPhase::Escalated => {
                    return Ok(iteration);
                }
            };

            match step {
                Ok(_) => {}
                Err(ConvoyError::Escalation { .. }) => {}
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn report_blocker(
        &self,
        description: impl Into<String>,
        severity: BlockerSeverity,
    ) -> Blocker {
        let blocker = self.blockers.report(description, severity);
        self.emit(
            "blocker.reported",
            serde_json::json!({
                "blocker_id": blocker.id,
                "description": blocker.description,
                "severity": blocker.severity.to_string(),
            }),
        )
        .await;
        warn!(
            blocker_id = blocker.id,
            severity = %blocker.severity,
            "Blocker reported"
        );
        blocker
    }

    pub async fn resolve_blocker(&self, blocker_id: &str) -> Result<Blocker> {
        let blocker = self.blockers.resolve(blocker_id)?;
        self.emit(
            "blocker.resolved",
            serde_json::json!({ "blocker_id": blocker.id }),
        )
        .await;
        Ok(blocker)
    }

    pub fn blockers(&self) -> Arc<BlockerRegistry> {
        Arc::clone(&self.blockers)
    }

    async fn run_executor_phase(
        &self,
        phase: IterationPhase,
        iteration: &Iteration,
    ) -> PhaseOutcome {
        let result = match phase {
            IterationPhase::Build => self.executor.build(iteration).await,
            IterationPhase::Fix => self.executor.fix(iteration).await,
            _ => self.executor.test(iteration).await,
        };
        match result {
            Ok(outcome) => outcome,
            Err(e) => PhaseOutcome::failed(vec![e.to_string()]),
        }
    }

    /// Assign the escalation level once and move the iteration to its
    /// terminal `Escalated` phase.
    async fn escalate(&self, id: IterationId, reason: &str) -> Result<Iteration> {
        let updated = self.update(id, |it| {
            if it.escalation_level == EscalationLevel::None {
                it.escalation_level = if it.errors.len() > 5 {
                    EscalationLevel::Critical
                } else if it.retry_count < 2 {
                    EscalationLevel::Medium
                } else {
                    EscalationLevel::High
                };
            }
            it.transition(IterationPhase::Escalated)?;
            it.status = IterationStatus::Escalated;
            Ok(())
        })?;

        warn!(
            iteration_id = %id,
            level = %updated.escalation_level,
            reason,
            "Iteration escalated"
        );
        self.emit(
            "iteration.escalated",
            serde_json::json!({
                "iteration_id": id.to_string(),
                "plan_id": updated.plan_id,
                "level": updated.escalation_level.to_string(),
                "reason": reason,
                "retry_count": updated.retry_count,
                "fix_attempts": updated.fix_attempts,
                "errors": updated.errors,
                "failed_tests": updated.failed_tests,
            }),
        )
        .await;
        Ok(updated)
    }

    fn require_phase(&self, id: IterationId, expected: IterationPhase) -> Result<Iteration> {
        let iteration = self
            .get_iteration(id)
            .ok_or_else(|| ConvoyError::IterationNotFound(id.to_string()))?;
        if iteration.phase != expected {
            return Err(ConvoyError::InvalidPhaseTransition {
                from: iteration.phase.to_string(),
                to: expected.to_string(),
                allowed: iteration
                    .phase
                    .allowed_transitions()
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }
        Ok(iteration)
    }

    fn update<F>(&self, id: IterationId, f: F) -> Result<Iteration>
    where
        F: FnOnce(&mut Iteration) -> Result<()>,
    {
        let mut entry = self
            .iterations
            .get_mut(&id)
            .ok_or_else(|| ConvoyError::IterationNotFound(id.to_string()))?;
        f(entry.value_mut())?;
        Ok(entry.value().clone())
    }

    async fn emit_phase(&self, iteration: &Iteration, phase: IterationPhase, stage: &str) {
        self.emit(
            &format!("iteration.phase.{}", stage),
            serde_json::json!({
                "iteration_id": iteration.id.to_string(),
                "plan_id": iteration.plan_id,
                "phase": phase.to_string(),
                "retry_count": iteration.retry_count,
                "fix_attempts": iteration.fix_attempts,
            }),
        )
        .await;
    }

    async fn emit_completed(&self, iteration: &Iteration) {
        info!(iteration_id = %iteration.id, "Iteration complete");
        self.emit(
            "iteration.completed",
            serde_json::json!({
                "iteration_id": iteration.id.to_string(),
                "plan_id": iteration.plan_id,
                "retry_count": iteration.retry_count,
                "fix_attempts": iteration.fix_attempts,
            }),
        )
        .await;
    }

    async fn emit(&self, event_type: &str, payload: serde_json::Value) {
        let result = self
            .bus
            .publish(
                event_type,
                payload,
                PublishOptions::with_priority(Priority::High).from_source("iteration"),
            )
            .await;
        if let Err(e) = result {
            tracing::debug!(event_type, error = %e, "Lifecycle event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    use crate::config::BusConfig;

    /// Executor fed from per-phase outcome scripts; empty scripts pass.
    #[derive(Default)]
    struct ScriptedExecutor {
        build: Mutex<VecDeque<PhaseOutcome>>,
        test: Mutex<VecDeque<PhaseOutcome>>,
        fix: Mutex<VecDeque<PhaseOutcome>>,
    }

    impl ScriptedExecutor {
        fn script(
            build: Vec<PhaseOutcome>,
            test: Vec<PhaseOutcome>,
            fix: Vec<PhaseOutcome>,
        ) -> Arc<Self> {
            Arc::new(Self {
                build: Mutex::new(build.into()),
                test: Mutex::new(test.into()),
                fix: Mutex::new(fix.into()),
            })
        }

        fn next(queue: &Mutex<VecDeque<PhaseOutcome>>) -> PhaseOutcome {
            queue.lock().pop_front().unwrap_or_else(PhaseOutcome::passed)
        }
    }

    #[async_trait::async_trait]
    impl PhaseExecutor for ScriptedExecutor {
        async fn build(&self, _iteration: &Iteration) -> Result<PhaseOutcome> {
            Ok(Self::next(&self.build))
        }

        async fn test(&self, _iteration: &Iteration) -> Result<PhaseOutcome> {
            Ok(Self::next(&self.test))
        }

        async fn fix(&self, _iteration: &Iteration) -> Result<PhaseOutcome> {
            Ok(Self::next(&self.fix))
        }
    }

    fn manager_with(executor: Arc<ScriptedExecutor>) -> IterationManager {
        let bus = EventBus::new(BusConfig::default());
        bus.start();
        IterationManager::new(bus, IterationConfig::default()).with_executor(executor)
    }

    fn fail(msg: &str) -> PhaseOutcome {
        PhaseOutcome::failed(vec![msg.to_string()])
    }

    #[tokio::test]
    async fn test_clean_cycle_completes() {
        let manager = manager_with(ScriptedExecutor::script(vec![], vec![], vec![]));
        let id = manager.start_iteration("plan-1", None).await;

        let done = manager.run_full_cycle(id).await.unwrap();
        assert_eq!(done.phase, IterationPhase::Complete);
        assert_eq!(done.status, IterationStatus::Complete);
        assert_eq!(done.fix_attempts, 0);
    }

    #[tokio::test]
    async fn test_failing_tests_route_through_fix_and_verify() {
        let executor = ScriptedExecutor::script(
            vec![],
            // First test run fails, verify re-run passes.
            vec![fail("assertion failed").with_failed_tests(vec!["test_a".into()])],
            vec![],
        );
        let manager = manager_with(executor);
        let id = manager.start_iteration("plan-1", None).await;

        let done = manager.run_full_cycle(id).await.unwrap();
        assert_eq!(done.phase, IterationPhase::Complete);
        assert_eq!(done.fix_attempts, 1);
        assert_eq!(done.failed_tests, vec!["test_a".to_string()]);
    }

    #[tokio::test]
    async fn test_verify_always_failing_escalates_at_exact_bound() {
        // Tests never pass, so every verify fails and fixes keep being
        // consumed until the budget is spent.
        let executor = ScriptedExecutor::script(
            vec![],
            vec![fail("t1"), fail("t2"), fail("t3"), fail("t4"), fail("t5")],
            vec![],
        );
        let manager = manager_with(executor);
        let id = manager
            .start_iteration(
                "plan-1",
                Some(IterationOptions {
                    max_retries: 3,
                    max_fix_attempts: 3,
                }),
            )
            .await;

        let done = manager.run_full_cycle(id).await.unwrap();
        assert_eq!(done.phase, IterationPhase::Escalated);
        assert_eq!(done.status, IterationStatus::Escalated);
        assert_eq!(done.fix_attempts, 3);
    }

    #[tokio::test]
    async fn test_fix_at_bound_is_rejected() {
        let executor =
            ScriptedExecutor::script(vec![], vec![fail("t"), fail("t still failing")], vec![]);
        let manager = manager_with(executor);
        let id = manager
            .start_iteration(
                "plan-1",
                Some(IterationOptions {
                    max_retries: 3,
                    max_fix_attempts: 1,
                }),
            )
            .await;

        manager.run_build_phase(id).await.unwrap();
        manager.run_test_phase(id).await.unwrap();
        manager.run_fix_phase(id).await.unwrap();

        // Fail verify so we are back in Fix with the budget spent.
        let err = manager.run_verify_phase(id).await.unwrap_err();
        assert!(matches!(err, ConvoyError::Escalation { .. }));

        let done = manager.get_iteration(id).unwrap();
        assert_eq!(done.fix_attempts, 1);
        assert_eq!(done.phase, IterationPhase::Escalated);
    }

    #[tokio::test]
    async fn test_build_retries_exhausted_escalates_medium() {
        let executor = ScriptedExecutor::script(vec![fail("no compiler")], vec![], vec![]);
        let manager = manager_with(executor);
        let id = manager
            .start_iteration(
                "plan-1",
                Some(IterationOptions {
                    max_retries: 1,
                    max_fix_attempts: 3,
                }),
            )
            .await;

        let done = manager.run_full_cycle(id).await.unwrap();
        assert_eq!(done.phase, IterationPhase::Escalated);
        // retry_count == 1 < 2 at escalation time.
        assert_eq!(done.escalation_level, EscalationLevel::Medium);
    }

    #[tokio::test]
    async fn test_many_errors_escalate_critical() {
        let failures: Vec<PhaseOutcome> = (0..8).map(|i| fail(&format!("err {}", i))).collect();
        let executor = ScriptedExecutor::script(failures, vec![], vec![]);
        let manager = manager_with(executor);
        let id = manager
            .start_iteration(
                "plan-1",
                Some(IterationOptions {
                    max_retries: 7,
                    max_fix_attempts: 3,
                }),
            )
            .await;

        let done = manager.run_full_cycle(id).await.unwrap();
        assert_eq!(done.phase, IterationPhase::Escalated);
        assert_eq!(done.escalation_level, EscalationLevel::Critical);
    }

    #[tokio::test]
    async fn test_phase_out_of_order_rejected() {
        let manager = manager_with(ScriptedExecutor::script(vec![], vec![], vec![]));
        let id = manager.start_iteration("plan-1", None).await;

        let err = manager.run_fix_phase(id).await.unwrap_err();
        assert!(matches!(err, ConvoyError::InvalidPhaseTransition { .. }));
    }

    #[tokio::test]
    async fn test_escalation_level_is_set_once() {
        let executor = ScriptedExecutor::script(vec![fail("a")], vec![], vec![]);
        let manager = manager_with(executor);
        let id = manager
            .start_iteration(
                "plan-1",
                Some(IterationOptions {
                    max_retries: 1,
                    max_fix_attempts: 1,
                }),
            )
            .await;

        let done = manager.run_full_cycle(id).await.unwrap();
        let level = done.escalation_level;
        assert_ne!(level, EscalationLevel::None);

        // Terminal: further phase calls are rejected and the level is stable.
        assert!(manager.run_build_phase(id).await.is_err());
        assert_eq!(manager.get_iteration(id).unwrap().escalation_level, level);
    }

    #[tokio::test]
    async fn test_blocker_report_and_resolve() {
        let manager = manager_with(ScriptedExecutor::script(vec![], vec![], vec![]));
        let blocker = manager
            .report_blocker("waiting on credentials", BlockerSeverity::High)
            .await;
        assert_eq!(manager.blockers().open_count(), 1);

        manager.resolve_blocker(&blocker.id).await.unwrap();
        assert_eq!(manager.blockers().open_count(), 0);
    }
}
