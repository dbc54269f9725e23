use std::fmt;

use serde::{Deserialize, Serialize};

/// Phase of a build/test/fix/verify cycle. `Build` and `Test` are initial;
/// `Complete` and `Escalated` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationPhase {
    #[default]
    Build,
    Test,
    Fix,
    Verify,
    Complete,
    Escalated,
}

impl IterationPhase {
    pub fn allowed_transitions(&self) -> &'static [IterationPhase] {
        use IterationPhase::*;
        match self {
            Build => &[Test, Escalated],
            Test => &[Complete, Fix, Escalated],
            Fix => &[Verify, Escalated],
            Verify => &[Complete, Fix, Escalated],
            Complete => &[],
            Escalated => &[],
        }
    }

    pub fn can_transition_to(&self, target: IterationPhase) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Escalated)
    }

    pub fn is_initial(&self) -> bool {
        matches!(self, Self::Build | Self::Test)
    }
}

impl fmt::Display for IterationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Build => "build",
            Self::Test => "test",
            Self::Fix => "fix",
            Self::Verify => "verify",
            Self::Complete => "complete",
            Self::Escalated => "escalated",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        assert!(IterationPhase::Build.can_transition_to(IterationPhase::Test));
        assert!(IterationPhase::Test.can_transition_to(IterationPhase::Complete));
        assert!(IterationPhase::Test.can_transition_to(IterationPhase::Fix));
        assert!(IterationPhase::Fix.can_transition_to(IterationPhase::Verify));
        assert!(IterationPhase::Verify.can_transition_to(IterationPhase::Complete));
        assert!(IterationPhase::Verify.can_transition_to(IterationPhase::Fix));
    }

    #[test]
    fn test_every_active_phase_can_escalate() {
        for phase in [
            IterationPhase::Build,
            IterationPhase::Test,
            IterationPhase::Fix,
            IterationPhase::Verify,
        ] {
            assert!(phase.can_transition_to(IterationPhase::Escalated));
        }
    }

    #[test]
    fn test_terminal_phases_have_no_exits() {
        assert!(IterationPhase::Complete.allowed_transitions().is_empty());
        assert!(IterationPhase::Escalated.allowed_transitions().is_empty());
        assert!(IterationPhase::Complete.is_terminal());
        assert!(IterationPhase::Escalated.is_terminal());
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!IterationPhase::Build.can_transition_to(IterationPhase::Fix));
        assert!(!IterationPhase::Build.can_transition_to(IterationPhase::Complete));
        assert!(!IterationPhase::Fix.can_transition_to(IterationPhase::Test));
    }
}
