//! Checkpoints: periodic snapshots of plan, progress, and blocker state,
//! written atomically and used only for recovery.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::iteration::Blocker;
use crate::scheduler::{TaskPlan, TaskRecord, TaskState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub plan_id: String,
    pub created_at: DateTime<Utc>,
    pub plan: TaskPlan,
    pub progress: Vec<TaskRecord>,
    pub blockers: Vec<Blocker>,
}

impl Checkpoint {
    pub fn capture<'a>(
        plan: &TaskPlan,
        records: impl IntoIterator<Item = &'a TaskRecord>,
        blockers: Vec<Blocker>,
    ) -> Self {
        let mut progress: Vec<TaskRecord> = records.into_iter().cloned().collect();
        progress.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        let completed = progress
            .iter()
            .filter(|r| r.state == TaskState::Completed)
            .count();
        let timestamp = Utc::now();

        Self {
            id: format!(
                "{}_checkpoint-{:03}",
                timestamp.format("%Y%m%dT%H%M%S%3fZ"),
                completed
            ),
            plan_id: plan.id().to_string(),
            created_at: timestamp,
            plan: plan.clone(),
            progress,
            blockers,
        }
    }

    pub fn completed_count(&self) -> usize {
        self.progress
            .iter()
            .filter(|r| r.state == TaskState::Completed)
            .count()
    }

    pub fn open_blockers(&self) -> usize {
        self.blockers.iter().filter(|b| b.is_open()).count()
    }
}

pub struct CheckpointStore {
    checkpoints_dir: PathBuf,
    max_checkpoints: usize,
}

impl CheckpointStore {
    pub fn new(checkpoints_dir: impl AsRef<Path>, max_checkpoints: usize) -> Self {
        Self {
            checkpoints_dir: checkpoints_dir.as_ref().to_path_buf(),
            max_checkpoints: max_checkpoints.max(1),
        }
    }

    fn plan_dir(&self, plan_id: &str) -> PathBuf {
        self.checkpoints_dir.join(plan_id)
    }

    fn checkpoint_file(&self, plan_id: &str, checkpoint_id: &str) -> PathBuf {
        self.plan_dir(plan_id).join(format!("{}.json", checkpoint_id))
    }

    /// Persist a checkpoint with an atomic temp-file + rename write.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let dir = self.plan_dir(&checkpoint.plan_id);
        fs::create_dir_all(&dir).await?;

        let file = self.checkpoint_file(&checkpoint.plan_id, &checkpoint.id);
        let temp_file = file.with_extension("json.tmp");

        let json = serde_json::to_string_pretty(checkpoint)?;
        fs::write(&temp_file, &json).await?;
        fs::rename(&temp_file, &file).await.inspect_err(|_| {
            let _ = std::fs::remove_file(&temp_file);
        })?;

        info!(
            checkpoint_id = checkpoint.id,
            plan_id = checkpoint.plan_id,
            completed = checkpoint.completed_count(),
            "Checkpoint saved"
        );

        self.cleanup_old(&checkpoint.plan_id, self.max_checkpoints)
            .await?;
        Ok(())
    }

    pub async fn load(&self, plan_id: &str, checkpoint_id: &str) -> Result<Checkpoint> {
        let file = self.checkpoint_file(plan_id, checkpoint_id);
        let content = fs::read_to_string(&file).await?;
        Ok(serde_json::from_str(&content)?)
    }

    pub async fn list(&self, plan_id: &str) -> Result<Vec<Checkpoint>> {
        let mut checkpoints = Vec::new();
        for name in self.checkpoint_ids(plan_id).await? {
            match self.load(plan_id, &name).await {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(e) => {
                    warn!(checkpoint_id = name, error = %e, "Skipping unreadable checkpoint")
                }
            }
        }
        checkpoints.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(checkpoints)
    }

    /// Load only the most recent checkpoint, using the timestamp-prefixed
    /// filenames to avoid reading every file.
    pub async fn latest(&self, plan_id: &str) -> Result<Option<Checkpoint>> {
        let mut names = self.checkpoint_ids(plan_id).await?;
        if names.is_empty() {
            return Ok(None);
        }
        names.sort_by(|a, b| b.cmp(a));

        match self.load(plan_id, &names[0]).await {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(e) => {
                warn!(checkpoint_id = names[0], error = %e, "Failed to load latest checkpoint");
                Ok(None)
            }
        }
    }

    /// Delete old checkpoints, keeping the most recent `keep_count`.
    pub async fn cleanup_old(&self, plan_id: &str, keep_count: usize) -> Result<usize> {
        let mut names = self.checkpoint_ids(plan_id).await?;
        if names.len() <= keep_count {
            return Ok(0);
        }

        names.sort_by(|a, b| b.cmp(a));
        let mut deleted = 0;
        for name in &names[keep_count..] {
            let file = self.checkpoint_file(plan_id, name);
            if fs::remove_file(&file).await.is_ok() {
                deleted += 1;
            }
        }

        debug!(plan_id, deleted, "Cleaned up old checkpoints");
        Ok(deleted)
    }

    async fn checkpoint_ids(&self, plan_id: &str) -> Result<Vec<String>> {
        let dir = self.plan_dir(plan_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                if let Some(name) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }
}
