//! Progress tracking across execution rounds.

use serde::{Deserialize, Serialize};

/// Snapshot of execution progress at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub round: u32,
    pub remaining: usize,
    pub failed: usize,
    pub open_blockers: usize,
}

impl ProgressSnapshot {
    pub fn new(round: u32, remaining: usize, failed: usize) -> Self {
        Self {
            round,
            remaining,
            failed,
            open_blockers: 0,
        }
    }

    pub fn with_open_blockers(mut self, open_blockers: usize) -> Self {
        self.open_blockers = open_blockers;
        self
    }
}

/// Trend classification over recorded rounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressTrend {
    /// Remaining work is shrinking.
    Advancing { rate: f32 },
    /// No significant change yet.
    Steady,
    /// No change for the configured number of rounds.
    Stalled { rounds: u32 },
    /// New failures appeared.
    Regressing { newly_failed: usize },
}

impl ProgressTrend {
    pub fn is_advancing(&self) -> bool {
        matches!(self, Self::Advancing { .. })
    }

    pub fn is_stalled(&self) -> bool {
        matches!(self, Self::Stalled { .. })
    }

    pub fn should_escalate(&self, stall_threshold: u32) -> bool {
        match self {
            Self::Stalled { rounds } => *rounds >= stall_threshold,
            Self::Regressing { .. } => true,
            _ => false,
        }
    }
}

/// Records per-round completion state and classifies the trend, feeding
/// escalation decisions and status reporting.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    history: Vec<ProgressSnapshot>,
    stall_threshold: u32,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(3)
    }
}

impl ProgressTracker {
    pub fn new(stall_threshold: u32) -> Self {
        Self {
            history: Vec::new(),
            stall_threshold,
        }
    }

    pub fn record(&mut self, snapshot: ProgressSnapshot) {
        self.history.push(snapshot);
    }

    pub fn analyze(&self) -> ProgressTrend {
        if self.history.len() < 2 {
            return ProgressTrend::Steady;
        }

        let current = &self.history[self.history.len() - 1];
        let previous = &self.history[self.history.len() - 2];

        if current.failed > previous.failed {
            return ProgressTrend::Regressing {
                newly_failed: current.failed - previous.failed,
            };
        }

        if current.remaining < previous.remaining {
            let rate = (previous.remaining - current.remaining) as f32
                / previous.remaining.max(1) as f32;
            return ProgressTrend::Advancing { rate };
        }

        let stalled_rounds = self.consecutive_stall();
        if stalled_rounds >= self.stall_threshold {
            ProgressTrend::Stalled {
                rounds: stalled_rounds,
            }
        } else {
            ProgressTrend::Steady
        }
    }

    fn consecutive_stall(&self) -> u32 {
        let Some(last) = self.history.last() else {
            return 0;
        };
        self.history
            .iter()
            .rev()
            .take_while(|s| s.remaining == last.remaining)
            .count() as u32
    }

    pub fn should_escalate(&self) -> bool {
        self.analyze().should_escalate(self.stall_threshold)
    }

    pub fn current_round(&self) -> u32 {
        self.history.last().map(|s| s.round).unwrap_or(0)
    }

    pub fn total_rounds(&self) -> usize {
        self.history.len()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}
