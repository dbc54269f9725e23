//! On-disk state snapshots with checksum validation and corruption fallback.
//!
//! Snapshots capture per-handler serialized state for recovery only; the
//! newest valid snapshot wins, and corrupt files are skipped in favor of the
//! next older one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{ConvoyError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub version: u32,
    pub state: HashMap<String, serde_json::Value>,
    /// crc32 of the serialized `state` map, validated on load.
    pub checksum: u32,
}

impl StateSnapshot {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            timestamp: Utc::now(),
            version,
            state: HashMap::new(),
            checksum: 0,
        }
    }

    pub fn with_handler_state(
        mut self,
        handler: impl Into<String>,
        state: serde_json::Value,
    ) -> Self {
        self.state.insert(handler.into(), state);
        self
    }

    fn compute_checksum(state: &HashMap<String, serde_json::Value>) -> Result<u32> {
        // BTreeMap iteration gives a stable byte representation.
        let ordered: std::collections::BTreeMap<&String, &serde_json::Value> =
            state.iter().collect();
        let bytes = serde_json::to_vec(&ordered)?;
        Ok(crc32fast::hash(&bytes))
    }

    fn seal(&mut self) -> Result<()> {
        self.checksum = Self::compute_checksum(&self.state)?;
        Ok(())
    }

    fn is_intact(&self) -> bool {
        Self::compute_checksum(&self.state)
            .map(|sum| sum == self.checksum)
            .unwrap_or(false)
    }
}

pub struct SnapshotStore {
    snapshots_dir: PathBuf,
    max_per_name: usize,
}

impl SnapshotStore {
    pub fn new(snapshots_dir: impl AsRef<Path>) -> Self {
        Self {
            snapshots_dir: snapshots_dir.as_ref().to_path_buf(),
            max_per_name: 3,
        }
    }

    pub fn with_max_per_name(mut self, max: usize) -> Self {
        self.max_per_name = max.max(1);
        self
    }

    fn snapshot_file(&self, name: &str, timestamp: &DateTime<Utc>, version: u32) -> PathBuf {
        self.snapshots_dir.join(format!(
            "{}_{}_v{:04}.json",
            timestamp.format("%Y%m%dT%H%M%S%3fZ"),
            name,
            version
        ))
    }

    /// Seal and persist a snapshot with an atomic temp-file + rename write.
    pub async fn save(&self, mut snapshot: StateSnapshot) -> Result<StateSnapshot> {
        snapshot.seal()?;
        fs::create_dir_all(&self.snapshots_dir).await?;

        let file = self.snapshot_file(&snapshot.name, &snapshot.timestamp, snapshot.version);
        let temp_file = file.with_extension("json.tmp");

        let json = serde_json::to_string_pretty(&snapshot)?;
        fs::write(&temp_file, &json).await?;
        fs::rename(&temp_file, &file).await.inspect_err(|_| {
            let _ = std::fs::remove_file(&temp_file);
        })?;

        info!(
            name = snapshot.name,
            version = snapshot.version,
            "Snapshot saved"
        );

        self.cleanup_old(&snapshot.name).await?;
        Ok(snapshot)
    }

    /// Load the newest intact snapshot for a name, skipping corrupt files.
    pub async fn load_latest(&self, name: &str) -> Result<Option<StateSnapshot>> {
        let mut files = self.files_for(name).await?;
        if files.is_empty() {
            return Ok(None);
        }

        // Timestamp-prefixed filenames sort naturally; newest first.
        files.sort_by(|a, b| b.cmp(a));

        for file in files {
            let content = match fs::read_to_string(&file).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "Unreadable snapshot, skipping");
                    continue;
                }
            };
            match serde_json::from_str::<StateSnapshot>(&content) {
                Ok(snapshot) if snapshot.is_intact() => {
                    debug!(name, version = snapshot.version, "Snapshot loaded");
                    return Ok(Some(snapshot));
                }
                Ok(snapshot) => {
                    warn!(
                        file = %file.display(),
                        version = snapshot.version,
                        "Snapshot checksum mismatch, falling back to older one"
                    );
                }
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "Corrupt snapshot, skipping");
                }
            }
        }

        Err(ConvoyError::Store(format!(
            "All snapshots for '{}' are corrupt",
            name
        )))
    }

    /// Next version number for a name (highest existing + 1).
    pub async fn next_version(&self, name: &str) -> Result<u32> {
        let files = self.files_for(name).await?;
        let max = files
            .iter()
            .filter_map(|f| f.file_stem().and_then(|s| s.to_str()))
            .filter_map(|stem| stem.rsplit("_v").next())
            .filter_map(|v| v.parse::<u32>().ok())
            .max()
            .unwrap_or(0);
        Ok(max + 1)
    }

    async fn files_for(&self, name: &str) -> Result<Vec<PathBuf>> {
        if !self.snapshots_dir.exists() {
            return Ok(Vec::new());
        }

        let marker = format!("_{}_v", name);
        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.snapshots_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_json = path.extension().is_some_and(|e| e == "json");
            let matches_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.contains(&marker));
            if is_json && matches_name {
                files.push(path);
            }
        }
        Ok(files)
    }

    async fn cleanup_old(&self, name: &str) -> Result<()> {
        let mut files = self.files_for(name).await?;
        if files.len() <= self.max_per_name {
            return Ok(());
        }

        files.sort_by(|a, b| b.cmp(a));
        for file in &files[self.max_per_name..] {
            if fs::remove_file(file).await.is_ok() {
                debug!(file = %file.display(), "Removed old snapshot");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn snapshot(name: &str, version: u32, value: i64) -> StateSnapshot {
        StateSnapshot::new(name, version)
            .with_handler_state("tracker", serde_json::json!({"count": value}))
    }

    #[tokio::test]
    async fn test_save_and_load_latest() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());

        store.save(snapshot("bus", 1, 10)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.save(snapshot("bus", 2, 20)).await.unwrap();

        let latest = store.load_latest("bus").await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.state["tracker"]["count"], 20);
    }

    #[tokio::test]
    async fn test_load_missing_name() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());
        assert!(store.load_latest("nothing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_falls_back() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());

        store.save(snapshot("bus", 1, 10)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let newest = store.save(snapshot("bus", 2, 20)).await.unwrap();

        // Corrupt the newest file on disk.
        let file = store.snapshot_file(&newest.name, &newest.timestamp, newest.version);
        std::fs::write(&file, "{ not json").unwrap();

        let recovered = store.load_latest("bus").await.unwrap().unwrap();
        assert_eq!(recovered.version, 1);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_detected() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());

        let saved = store.save(snapshot("bus", 1, 10)).await.unwrap();
        let file = store.snapshot_file(&saved.name, &saved.timestamp, saved.version);

        // Tamper with the state but keep valid JSON.
        let mut tampered: StateSnapshot =
            serde_json::from_str(&std::fs::read_to_string(&file).unwrap()).unwrap();
        tampered
            .state
            .insert("tracker".into(), serde_json::json!({"count": 999}));
        std::fs::write(&file, serde_json::to_string(&tampered).unwrap()).unwrap();

        assert!(store.load_latest("bus").await.is_err());
    }

    #[tokio::test]
    async fn test_cleanup_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path()).with_max_per_name(2);

        for v in 1..=4 {
            store.save(snapshot("bus", v, v as i64)).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let files = store.files_for("bus").await.unwrap();
        assert_eq!(files.len(), 2);
        let latest = store.load_latest("bus").await.unwrap().unwrap();
        assert_eq!(latest.version, 4);
    }

    #[tokio::test]
    async fn test_next_version_increments() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());

        assert_eq!(store.next_version("bus").await.unwrap(), 1);
        store.save(snapshot("bus", 1, 1)).await.unwrap();
        assert_eq!(store.next_version("bus").await.unwrap(), 2);
    }
}
