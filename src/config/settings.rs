use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{ConvoyError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvoyConfig {
    pub bus: BusConfig,
    pub scheduler: SchedulerConfig,
    pub iteration: IterationConfig,
    pub checkpoint: CheckpointConfig,
    pub persistence: PersistenceConfig,
}

impl ConvoyConfig {
    pub async fn load(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join("config.toml");
        let config = if config_path.exists() {
            let content = fs::read_to_string(&config_path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, data_dir: &Path) -> Result<()> {
        self.validate()?;
        let config_path = data_dir.join("config.toml");
        let content =
            toml::to_string_pretty(self).map_err(|e| ConvoyError::Config(e.to_string()))?;
        fs::write(&config_path, content).await?;
        Ok(())
    }

    /// Validate configuration values for consistency and safety.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.bus.max_history == 0 {
            errors.push("bus.max_history must be greater than 0");
        }
        if self.bus.request_timeout_ms == 0 {
            errors.push("bus.request_timeout_ms must be greater than 0");
        }

        if self.scheduler.max_concurrency == 0 {
            errors.push("scheduler.max_concurrency must be greater than 0");
        }

        if self.iteration.max_retries == 0 {
            errors.push("iteration.max_retries must be greater than 0");
        }
        if self.iteration.max_fix_attempts == 0 {
            errors.push("iteration.max_fix_attempts must be greater than 0");
        }
        if self.iteration.phase_timeout_ms == 0 {
            errors.push("iteration.phase_timeout_ms must be greater than 0");
        }

        if self.checkpoint.interval_tasks == 0 {
            errors.push("checkpoint.interval_tasks must be greater than 0");
        }
        if self.checkpoint.max_checkpoints == 0 {
            errors.push("checkpoint.max_checkpoints must be greater than 0");
        }

        if self.persistence.backend == StoreBackend::Sqlite && self.persistence.db_path.is_none() {
            errors.push("persistence.db_path is required for the sqlite backend");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConvoyError::Config(errors.join("; ")))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Maximum number of dispatched messages retained in history.
    pub max_history: usize,
    /// Default timeout applied to `request()` calls without an explicit one.
    pub request_timeout_ms: u64,
    /// Replay unprocessed persisted messages when the runtime starts.
    pub recover_on_start: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_history: 500,
            request_timeout_ms: 30_000,
            recover_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of tasks executing in parallel.
    pub max_concurrency: usize,
    /// Retries allowed per task before it is marked failed.
    pub max_task_retries: u32,
    /// Continue past failures: a failed dependency counts as satisfied, so
    /// dependents still start. When false, dependents of a failed task are
    /// skipped transitively.
    pub continue_on_failure: bool,
    /// Delay between retry attempts for a failed task.
    pub retry_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            max_task_retries: 2,
            continue_on_failure: false,
            retry_delay_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IterationConfig {
    /// Phase retries allowed before escalation.
    pub max_retries: u32,
    /// Fix attempts allowed before escalation.
    pub max_fix_attempts: u32,
    /// Timeout for a single phase dispatched over the bus.
    pub phase_timeout_ms: u64,
}

impl Default for IterationConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_fix_attempts: 3,
            phase_timeout_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Checkpoint after this many task completions.
    pub interval_tasks: u32,
    /// Checkpoints retained per plan; older ones are deleted.
    pub max_checkpoints: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval_tasks: 5,
            max_checkpoints: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub backend: StoreBackend,
    /// Database path, required when `backend` is `sqlite`.
    pub db_path: Option<PathBuf>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            db_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ConvoyConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = ConvoyConfig::default();
        config.scheduler.max_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sqlite_backend_requires_path() {
        let mut config = ConvoyConfig::default();
        config.persistence.backend = StoreBackend::Sqlite;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("db_path"));
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = ConvoyConfig::default();
        config.bus.max_history = 0;
        config.iteration.max_fix_attempts = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("max_history"));
        assert!(err.contains("max_fix_attempts"));
    }

    #[tokio::test]
    async fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = ConvoyConfig::load(dir.path()).await.unwrap();
        assert_eq!(config.scheduler.max_concurrency, 4);
    }

    #[tokio::test]
    async fn test_save_and_reload_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = ConvoyConfig::default();
        config.scheduler.max_concurrency = 8;
        config.save(dir.path()).await.unwrap();

        let loaded = ConvoyConfig::load(dir.path()).await.unwrap();
        assert_eq!(loaded.scheduler.max_concurrency, 8);
    }
}
