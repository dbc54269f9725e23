//! Blockers reported during execution, surfaced in checkpoints and status.

use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{ConvoyError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockerSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for BlockerSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blocker {
    pub id: String,
    pub description: String,
    pub severity: BlockerSeverity,
    pub reported_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Blocker {
    fn new(description: impl Into<String>, severity: BlockerSeverity) -> Self {
        Self {
            id: format!("blk-{}", &uuid::Uuid::new_v4().to_string()[..8]),
            description: description.into(),
            severity,
            reported_at: Utc::now(),
            resolved_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

#[derive(Default)]
pub struct BlockerRegistry {
    blockers: RwLock<Vec<Blocker>>,
}

impl BlockerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, description: impl Into<String>, severity: BlockerSeverity) -> Blocker {
        let blocker = Blocker::new(description, severity);
        self.blockers.write().push(blocker.clone());
        blocker
    }

    pub fn resolve(&self, blocker_id: &str) -> Result<Blocker> {
        let mut blockers = self.blockers.write();
        let blocker = blockers
            .iter_mut()
            .find(|b| b.id == blocker_id)
            .ok_or_else(|| ConvoyError::BlockerNotFound(blocker_id.to_string()))?;
        if blocker.resolved_at.is_none() {
            blocker.resolved_at = Some(Utc::now());
        }
        Ok(blocker.clone())
    }

    pub fn open(&self) -> Vec<Blocker> {
        self.blockers
            .read()
            .iter()
            .filter(|b| b.is_open())
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Blocker> {
        self.blockers.read().clone()
    }

    pub fn open_count(&self) -> usize {
        self.blockers.read().iter().filter(|b| b.is_open()).count()
    }
}
