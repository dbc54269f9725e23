//! Runtime assembly: one explicitly constructed object owning the bus,
//! scheduler, iteration manager, and persistence, wired from configuration.
//!
//! There are no process-wide singletons; tests construct fresh runtimes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::bus::EventBus;
use crate::checkpoint::CheckpointStore;
use crate::config::{ConvoyConfig, StoreBackend};
use crate::error::Result;
use crate::iteration::{BlockerRegistry, IterationManager, PhaseExecutor};
use crate::persistence::{MemoryStore, SnapshotStore, SqliteStore, StateSnapshot, StateStore};
use crate::scheduler::AgentCoordinator;

pub struct RuntimeBuilder {
    config: ConvoyConfig,
    data_dir: PathBuf,
    store: Option<Arc<dyn StateStore>>,
    phase_executor: Option<Arc<dyn PhaseExecutor>>,
}

impl RuntimeBuilder {
    pub fn new(config: ConvoyConfig, data_dir: impl AsRef<Path>) -> Self {
        Self {
            config,
            data_dir: data_dir.as_ref().to_path_buf(),
            store: None,
            phase_executor: None,
        }
    }

    /// Override the configured store backend.
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the default bus-request phase executor.
    pub fn with_phase_executor(mut self, executor: Arc<dyn PhaseExecutor>) -> Self {
        self.phase_executor = Some(executor);
        self
    }

    pub fn build(self) -> Result<ConvoyRuntime> {
        self.config.validate()?;

        let store: Arc<dyn StateStore> = match self.store {
            Some(store) => store,
            None => match self.config.persistence.backend {
                StoreBackend::Memory => Arc::new(MemoryStore::new()),
                StoreBackend::Sqlite => {
                    let db_path = self
                        .config
                        .persistence
                        .db_path
                        .clone()
                        .unwrap_or_else(|| self.data_dir.join("state.db"));
                    Arc::new(SqliteStore::new(db_path)?)
                }
            },
        };

        let bus = EventBus::with_store(self.config.bus.clone(), Arc::clone(&store));
        let blockers = Arc::new(BlockerRegistry::new());
        let checkpoints = Arc::new(CheckpointStore::new(
            self.data_dir.join("checkpoints"),
            self.config.checkpoint.max_checkpoints,
        ));
        let snapshots = Arc::new(SnapshotStore::new(self.data_dir.join("snapshots")));

        let coordinator = Arc::new(
            AgentCoordinator::new(
                bus.clone(),
                self.config.scheduler.clone(),
                self.config.checkpoint.clone(),
            )
            .with_checkpoints(Arc::clone(&checkpoints))
            .with_blockers(Arc::clone(&blockers)),
        );

        let mut iterations = IterationManager::new(bus.clone(), self.config.iteration.clone())
            .with_blockers(Arc::clone(&blockers));
        if let Some(executor) = self.phase_executor {
            iterations = iterations.with_executor(executor);
        }

        Ok(ConvoyRuntime {
            config: self.config,
            bus,
            store,
            coordinator,
            iterations: Arc::new(iterations),
            checkpoints,
            snapshots,
            blockers,
        })
    }
}

pub struct ConvoyRuntime {
    config: ConvoyConfig,
    bus: EventBus,
    store: Arc<dyn StateStore>,
    coordinator: Arc<AgentCoordinator>,
    iterations: Arc<IterationManager>,
    checkpoints: Arc<CheckpointStore>,
    snapshots: Arc<SnapshotStore>,
    blockers: Arc<BlockerRegistry>,
}

impl ConvoyRuntime {
    /// Start the bus dispatch loop and, when configured, replay unprocessed
    /// persisted messages.
    pub async fn start(&self) -> Result<()> {
        self.bus.start();
        if self.config.bus.recover_on_start {
            let replayed = self.bus.recover().await?;
            if replayed > 0 {
                info!(replayed, "Runtime recovered pending messages");
            }
        }
        info!("Runtime started");
        Ok(())
    }

    /// Drain pending request timers, stop dispatch, flush unsaved state, and
    /// take a final state snapshot.
    pub async fn shutdown(&self) -> Result<()> {
        self.bus.shutdown().await?;
        self.store.flush().await?;

        let version = self.snapshots.next_version("runtime").await.unwrap_or(1);
        let snapshot = StateSnapshot::new("runtime", version)
            .with_handler_state("bus", serde_json::to_value(self.bus.get_stats())?)
            .with_handler_state("blockers", serde_json::to_value(self.blockers.open())?);
        if let Err(e) = self.snapshots.save(snapshot).await {
            tracing::warn!(error = %e, "Final state snapshot failed");
        }

        info!("Runtime shut down");
        Ok(())
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn scheduler(&self) -> &AgentCoordinator {
        &self.coordinator
    }

    pub fn iterations(&self) -> &IterationManager {
        &self.iterations
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        Arc::clone(&self.store)
    }

    pub fn checkpoints(&self) -> Arc<CheckpointStore> {
        Arc::clone(&self.checkpoints)
    }

    pub fn snapshots(&self) -> Arc<SnapshotStore> {
        Arc::clone(&self.snapshots)
    }

    pub fn blockers(&self) -> Arc<BlockerRegistry> {
        Arc::clone(&self.blockers)
    }

    pub fn config(&self) -> &ConvoyConfig {
        &self.config
    }
}
