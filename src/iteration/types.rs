use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::phase::IterationPhase;
use crate::config::IterationConfig;
use crate::error::{ConvoyError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IterationId(uuid::Uuid);

impl IterationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for IterationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IterationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Severity assigned when automated retry/fix is exhausted. Set once at the
/// moment of escalation; terminal for the iteration.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EscalationLevel {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for EscalationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    #[default]
    Active,
    Complete,
    Escalated,
}

impl IterationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Escalated)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IterationOptions {
    pub max_retries: u32,
    pub max_fix_attempts: u32,
}

impl From<&IterationConfig> for IterationOptions {
    fn from(config: &IterationConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            max_fix_attempts: config.max_fix_attempts,
        }
    }
}

/// One build/test/fix/verify cycle for an execution unit. Mutated only by
/// the iteration manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iteration {
    pub id: IterationId,
    pub plan_id: String,
    pub phase: IterationPhase,
    pub status: IterationStatus,
    pub retry_count: u32,
    pub fix_attempts: u32,
    pub escalation_level: EscalationLevel,
    pub errors: Vec<String>,
    pub failed_tests: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub options: IterationOptions,
}

impl Iteration {
    pub fn new(plan_id: impl Into<String>, options: IterationOptions) -> Self {
        let now = Utc::now();
        Self {
            id: IterationId::new(),
            plan_id: plan_id.into(),
            phase: IterationPhase::Build,
            status: IterationStatus::Active,
            retry_count: 0,
            fix_attempts: 0,
            escalation_level: EscalationLevel::None,
            errors: Vec::new(),
            failed_tests: Vec::new(),
            created_at: now,
            updated_at: now,
            options,
        }
    }

    pub(super) fn transition(&mut self, target: IterationPhase) -> Result<()> {
        if !self.phase.can_transition_to(target) {
            return Err(ConvoyError::InvalidPhaseTransition {
                from: self.phase.to_string(),
                to: target.to_string(),
                allowed: self
                    .phase
                    .allowed_transitions()
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }
        self.phase = target;
        self.updated_at = Utc::now();
        if target == IterationPhase::Complete {
            self.status = IterationStatus::Complete;
        }
        Ok(())
    }

    pub(super) fn record_failure(&mut self, outcome: &PhaseOutcome) {
        self.errors.extend(outcome.errors.iter().cloned());
        for test in &outcome.failed_tests {
            if !self.failed_tests.contains(test) {
                self.failed_tests.push(test.clone());
            }
        }
        self.updated_at = Utc::now();
    }

    pub fn retries_remaining(&self) -> bool {
        self.retry_count < self.options.max_retries
    }

    pub fn fix_attempts_remaining(&self) -> bool {
        self.fix_attempts < self.options.max_fix_attempts
    }
}

/// Result of a single phase execution reported by a phase executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseOutcome {
    pub success: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub failed_tests: Vec<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub detail: serde_json::Value,
}

impl PhaseOutcome {
    pub fn passed() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failed(errors: Vec<String>) -> Self {
        Self {
            success: false,
            errors,
            ..Self::default()
        }
    }

    pub fn with_failed_tests(mut self, failed_tests: Vec<String>) -> Self {
        self.failed_tests = failed_tests;
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }

    /// Parse an executor response payload. Unparseable payloads become a
    /// failure naming the problem rather than a panic.
    pub fn from_response(value: serde_json::Value) -> Self {
        match serde_json::from_value(value) {
            Ok(outcome) => outcome,
            Err(e) => Self::failed(vec![format!("Malformed phase response: {}", e)]),
        }
    }
}
