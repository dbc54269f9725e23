//! Agent coordinator: dispatches ready tasks to category handlers, bounded
//! by a concurrency ceiling, and retries failures per task.
//!
//! Scheduler state (ready, in-flight, settled) is mutated only by the
//! coordinator loop consuming a completion channel; task bodies run on
//! spawned tasks gated by a semaphore.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use super::handler::{AgentDefinition, AgentLoader, PassthroughHandler, TaskContext, TaskHandler};
use super::plan::{Task, TaskPlan};
use super::signal::SignalHandler;
use super::status::{ExecutionReport, ExecutionState, ExecutionStatus, TaskRecord, TaskState};
use crate::bus::{EventBus, Priority, PublishOptions};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::{CheckpointConfig, SchedulerConfig};
use crate::error::{ConvoyError, Result};
use crate::iteration::BlockerRegistry;
use crate::progress::{ProgressSnapshot, ProgressTracker};

const SIGNAL_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct TaskCompletion {
    task_id: String,
    attempts: u32,
    outcome: Result<serde_json::Value>,
}

pub struct AgentCoordinator {
    bus: EventBus,
    config: SchedulerConfig,
    checkpoint_config: CheckpointConfig,
    handlers: DashMap<String, Arc<dyn TaskHandler>>,
    default_handler: Arc<dyn TaskHandler>,
    agents: Mutex<Vec<AgentDefinition>>,
    agents_initialized: AtomicBool,
    signal: SignalHandler,
    checkpoints: Option<Arc<CheckpointStore>>,
    blockers: Arc<BlockerRegistry>,
    running: AtomicBool,
    status: RwLock<ExecutionStatus>,
    progress: Mutex<ProgressTracker>,
}

impl AgentCoordinator {
    pub fn new(bus: EventBus, config: SchedulerConfig, checkpoint_config: CheckpointConfig) -> Self {
        Self {
            bus,
            config,
            checkpoint_config,
            handlers: DashMap::new(),
            default_handler: Arc::new(PassthroughHandler),
            agents: Mutex::new(Vec::new()),
            agents_initialized: AtomicBool::new(false),
            signal: SignalHandler::new(),
            checkpoints: None,
            blockers: Arc::new(BlockerRegistry::new()),
            running: AtomicBool::new(false),
            status: RwLock::new(ExecutionStatus::default()),
            progress: Mutex::new(ProgressTracker::default()),
        }
    }

    pub fn with_checkpoints(mut self, store: Arc<CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn with_blockers(mut self, blockers: Arc<BlockerRegistry>) -> Self {
        self.blockers = blockers;
        self
    }

    /// Register an agent and its initialization hook. Loaders run in
    /// dependency order when the first execution starts.
    pub fn register_agent(
        &self,
        id: impl Into<String>,
        loader: Arc<dyn AgentLoader>,
        dependencies: Vec<String>,
    ) -> Result<()> {
        let id = id.into();
        let mut agents = self.agents.lock();
        if agents.iter().any(|a| a.id == id) {
            return Err(ConvoyError::Config(format!(
                "Agent already registered: {}",
                id
            )));
        }
        agents.push(AgentDefinition {
            id,
            dependencies,
            loader,
        });
        Ok(())
    }

    pub fn register_task_handler(
        &self,
        category: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) {
        self.handlers.insert(category.into(), handler);
    }

    pub fn pause(&self) {
        self.signal.pause();
        info!("Coordinator pause requested");
    }

    pub fn resume(&self) {
        self.signal.resume();
        info!("Coordinator resumed");
    }

    /// Cooperative cancel: halts new dispatch; in-flight tasks are not
    /// forcibly terminated.
    pub fn cancel(&self) {
        self.signal.cancel();
        info!("Coordinator cancel requested");
    }

    pub fn get_status(&self) -> ExecutionStatus {
        self.status.read().clone()
    }

    /// Per-round progress history for the current (or last) execution.
    pub fn get_progress(&self) -> ProgressTracker {
        self.progress.lock().clone()
    }

    pub fn blockers(&self) -> Arc<BlockerRegistry> {
        Arc::clone(&self.blockers)
    }

    /// Run a validated plan to completion. Ready tasks are recomputed the
    /// instant each task completes, so independent branches overlap up to
    /// `max_concurrency`.
    pub async fn execute(&self, plan: TaskPlan) -> Result<ExecutionReport> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ConvoyError::ExecutionInProgress(plan.id().to_string()));
        }
        let result = self.execute_inner(&plan).await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn execute_inner(&self, plan: &TaskPlan) -> Result<ExecutionReport> {
        self.signal.clear();
        self.progress.lock().clear();
        self.initialize_agents().await?;

        let started_at = Utc::now();
        let mut records: HashMap<String, TaskRecord> = plan
            .tasks()
            .iter()
            .map(|t| (t.id.clone(), TaskRecord::new(&t.id)))
            .collect();
        let mut completed: HashSet<String> = HashSet::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut dispatched: HashSet<String> = HashSet::new();
        let mut in_flight = 0usize;
        let mut since_checkpoint = 0u32;
        let mut cancelled = false;
        let mut pause_checkpointed = false;

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<TaskCompletion>();

        self.publish_event(
            "execution.started",
            serde_json::json!({
                "plan_id": plan.id(),
                "total_tasks": plan.len(),
            }),
        )
        .await;
        self.write_status(plan, &records, ExecutionState::Running);

        loop {
            if self.signal.is_cancelled() && !cancelled {
                cancelled = true;
                info!(plan_id = plan.id(), "Cancelling execution");
            }
            let paused = self.signal.is_paused();

            if !paused {
                pause_checkpointed = false;
            }

            if !cancelled && !self.config.continue_on_failure {
                self.cascade_skips(plan, &mut records, &dispatched, &failed)
                    .await;
            }

            if !paused && !cancelled {
                // Readiness: all dependencies completed; with
                // continue_on_failure a failed dependency also counts.
                let satisfied: HashSet<String> = if self.config.continue_on_failure {
                    completed.union(&failed).cloned().collect()
                } else {
                    completed.clone()
                };
                let excluded: HashSet<String> = records
                    .iter()
                    .filter(|(id, r)| dispatched.contains(*id) || r.state.is_settled())
                    .map(|(id, _)| id.clone())
                    .collect();

                for task in plan.ready_tasks(&satisfied, &excluded) {
                    // Dispatch only while a permit is free; the rest of the
                    // ready group waits for the next completion.
                    let permit = match Arc::clone(&semaphore).try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    dispatched.insert(task.id.clone());
                    if let Some(record) = records.get_mut(&task.id) {
                        record.state = TaskState::Running;
                        record.started_at = Some(Utc::now());
                    }
                    in_flight += 1;
                    self.publish_event(
                        "task.started",
                        serde_json::json!({
                            "plan_id": plan.id(),
                            "task_id": task.id,
                            "category": task.category,
                        }),
                    )
                    .await;
                    self.spawn_worker(task.clone(), permit, done_tx.clone());
                }
            }

            let all_settled = records.values().all(|r| r.state.is_settled());
            if in_flight == 0 {
                if cancelled || all_settled {
                    break;
                }
                if paused {
                    if !pause_checkpointed {
                        self.take_checkpoint(plan, &records).await;
                        pause_checkpointed = true;
                        self.write_status(plan, &records, ExecutionState::Paused);
                        info!(plan_id = plan.id(), "Execution paused");
                    }
                    tokio::time::sleep(SIGNAL_POLL_INTERVAL).await;
                    continue;
                }
                // No runnable work and nothing in flight: every remaining
                // pending task is blocked forever, which validation should
                // have ruled out.
                warn!(plan_id = plan.id(), "No dispatchable tasks remain, stopping");
                break;
            }

            tokio::select! {
                Some(done) = done_rx.recv() => {
                    in_flight -= 1;
                    since_checkpoint += 1;
                    self.record_completion(plan, &mut records, &mut completed, &mut failed, done)
                        .await;
                    self.write_status(plan, &records, ExecutionState::Running);
                    self.record_progress(plan, &records);

                    if since_checkpoint >= self.checkpoint_config.interval_tasks {
                        since_checkpoint = 0;
                        self.take_checkpoint(plan, &records).await;
                    }
                }
                _ = tokio::time::sleep(SIGNAL_POLL_INTERVAL) => {}
            }
        }

        // Cooperative drain: wait for in-flight tasks to finish on their own.
        while in_flight > 0 {
            if let Some(done) = done_rx.recv().await {
                in_flight -= 1;
                self.record_completion(plan, &mut records, &mut completed, &mut failed, done)
                    .await;
            } else {
                break;
            }
        }

        for record in records.values_mut() {
            if !record.state.is_settled() {
                record.state = TaskState::Skipped;
            }
        }

        let state = if cancelled {
            ExecutionState::Cancelled
        } else if failed.is_empty() {
            ExecutionState::Completed
        } else {
            ExecutionState::Failed
        };

        self.take_checkpoint(plan, &records).await;
        self.write_status(plan, &records, state);

        self.publish_event(
            "execution.completed",
            serde_json::json!({
                "plan_id": plan.id(),
                "state": state.to_string(),
                "completed": completed.len(),
                "failed": failed.len(),
            }),
        )
        .await;

        let mut report_records: Vec<TaskRecord> = plan
            .tasks()
            .iter()
            .filter_map(|t| records.remove(&t.id))
            .collect();
        report_records.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        info!(
            plan_id = plan.id(),
            state = %state,
            completed = completed.len(),
            failed = failed.len(),
            "Execution finished"
        );

        Ok(ExecutionReport {
            plan_id: plan.id().to_string(),
            state,
            records: report_records,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Run registered agent loaders in dependency order, once.
    async fn initialize_agents(&self) -> Result<()> {
        if self.agents_initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let agents = self.agents.lock().clone();
        let known: HashSet<&str> = agents.iter().map(|a| a.id.as_str()).collect();
        for agent in &agents {
            for dep in &agent.dependencies {
                if !known.contains(dep.as_str()) {
                    self.agents_initialized.store(false, Ordering::SeqCst);
                    return Err(ConvoyError::Config(format!(
                        "Agent '{}' depends on unregistered agent '{}'",
                        agent.id, dep
                    )));
                }
            }
        }

        let mut loaded: HashSet<String> = HashSet::new();
        let mut remaining: Vec<&AgentDefinition> = agents.iter().collect();
        while !remaining.is_empty() {
            let position = remaining
                .iter()
                .position(|a| a.dependencies.iter().all(|d| loaded.contains(d)));
            let Some(position) = position else {
                self.agents_initialized.store(false, Ordering::SeqCst);
                return Err(ConvoyError::CyclicDependency {
                    cycle: remaining.iter().map(|a| a.id.clone()).collect(),
                });
            };
            let agent = remaining.remove(position);
            debug!(agent_id = agent.id, "Loading agent");
            agent.loader.load().await.map_err(|e| {
                self.agents_initialized.store(false, Ordering::SeqCst);
                ConvoyError::Config(format!("Agent '{}' failed to load: {}", agent.id, e))
            })?;
            loaded.insert(agent.id.clone());
        }

        Ok(())
    }

    fn spawn_worker(
        &self,
        task: Task,
        permit: tokio::sync::OwnedSemaphorePermit,
        done_tx: mpsc::UnboundedSender<TaskCompletion>,
    ) {
        let handler = self
            .handlers
            .get(&task.category)
            .map(|h| Arc::clone(h.value()))
            .unwrap_or_else(|| Arc::clone(&self.default_handler));
        let bus = self.bus.clone();
        let signal = self.signal.clone();
        let max_retries = self.config.max_task_retries;
        let retry_delay = Duration::from_millis(self.config.retry_delay_ms);

        tokio::spawn(async move {
            let _permit = permit;
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                let ctx = TaskContext {
                    bus: bus.clone(),
                    attempt,
                };
                match handler.run(&task, ctx).await {
                    Ok(value) => {
                        let _ = done_tx.send(TaskCompletion {
                            task_id: task.id.clone(),
                            attempts: attempt,
                            outcome: Ok(value),
                        });
                        return;
                    }
                    Err(e) if attempt <= max_retries && !signal.is_cancelled() => {
                        warn!(
                            task_id = task.id,
                            attempt,
                            max_retries,
                            error = %e,
                            "Task attempt failed, retrying"
                        );
                        let _ = bus
                            .publish(
                                "task.retrying",
                                serde_json::json!({
                                    "task_id": task.id,
                                    "attempt": attempt,
                                    "max_retries": max_retries,
                                    "error": e.to_string(),
                                }),
                                PublishOptions::with_priority(Priority::High)
                                    .from_source("coordinator"),
                            )
                            .await;
                        tokio::time::sleep(retry_delay).await;
                    }
                    Err(e) => {
                        let _ = done_tx.send(TaskCompletion {
                            task_id: task.id.clone(),
                            attempts: attempt,
                            outcome: Err(ConvoyError::TaskFailed {
                                task_id: task.id.clone(),
                                message: e.to_string(),
                            }),
                        });
                        return;
                    }
                }
            }
        });
    }

    async fn record_completion(
        &self,
        plan: &TaskPlan,
        records: &mut HashMap<String, TaskRecord>,
        completed: &mut HashSet<String>,
        failed: &mut HashSet<String>,
        done: TaskCompletion,
    ) {
        let Some(record) = records.get_mut(&done.task_id) else {
            warn!(task_id = done.task_id, "Completion for unknown task");
            return;
        };
        record.attempts = done.attempts;
        record.finished_at = Some(Utc::now());

        match done.outcome {
            Ok(_) => {
                record.state = TaskState::Completed;
                completed.insert(done.task_id.clone());
                self.publish_event(
                    "task.completed",
                    serde_json::json!({
                        "plan_id": plan.id(),
                        "task_id": done.task_id,
                        "attempts": done.attempts,
                    }),
                )
                .await;
            }
            Err(e) => {
                record.state = TaskState::Failed;
                record.error = Some(e.to_string());
                failed.insert(done.task_id.clone());
                self.publish_event(
                    "task.failed",
                    serde_json::json!({
                        "plan_id": plan.id(),
                        "task_id": done.task_id,
                        "attempts": done.attempts,
                        "error": e.to_string(),
                    }),
                )
                .await;
            }
        }
    }

    /// Mark pending tasks whose dependencies failed (or were skipped) as
    /// skipped, transitively.
    async fn cascade_skips(
        &self,
        plan: &TaskPlan,
        records: &mut HashMap<String, TaskRecord>,
        dispatched: &HashSet<String>,
        failed: &HashSet<String>,
    ) {
        let mut blocked: HashSet<String> = failed.clone();
        blocked.extend(
            records
                .iter()
                .filter(|(_, r)| r.state == TaskState::Skipped)
                .map(|(id, _)| id.clone()),
        );

        loop {
            let mut newly_skipped = Vec::new();
            for task in plan.tasks() {
                let is_pending = records
                    .get(&task.id)
                    .map(|r| r.state == TaskState::Pending)
                    .unwrap_or(false);
                if is_pending
                    && !dispatched.contains(&task.id)
                    && task.dependencies.iter().any(|d| blocked.contains(d))
                {
                    newly_skipped.push(task.id.clone());
                }
            }
            if newly_skipped.is_empty() {
                break;
            }
            for task_id in newly_skipped {
                if let Some(record) = records.get_mut(&task_id) {
                    record.state = TaskState::Skipped;
                }
                blocked.insert(task_id.clone());
                self.publish_event(
                    "task.skipped",
                    serde_json::json!({
                        "plan_id": plan.id(),
                        "task_id": task_id,
                        "reason": "dependency failed",
                    }),
                )
                .await;
            }
        }
    }

    fn record_progress(&self, plan: &TaskPlan, records: &HashMap<String, TaskRecord>) {
        let remaining = records.values().filter(|r| !r.state.is_settled()).count();
        let failed = records
            .values()
            .filter(|r| r.state == TaskState::Failed)
            .count();
        let mut progress = self.progress.lock();
        let round = progress.total_rounds() as u32 + 1;
        progress.record(
            ProgressSnapshot::new(round, remaining, failed)
                .with_open_blockers(self.blockers.open_count()),
        );
        if progress.analyze().is_stalled() {
            warn!(plan_id = plan.id(), "Execution progress has stalled");
        }
    }

    async fn take_checkpoint(&self, plan: &TaskPlan, records: &HashMap<String, TaskRecord>) {
        let Some(store) = self.checkpoints.as_ref() else {
            return;
        };
        let checkpoint = Checkpoint::capture(plan, records.values(), self.blockers.open());
        if let Err(e) = store.save(&checkpoint).await {
            warn!(plan_id = plan.id(), error = %e, "Checkpoint save failed");
        }
    }

    fn write_status(
        &self,
        plan: &TaskPlan,
        records: &HashMap<String, TaskRecord>,
        state: ExecutionState,
    ) {
        let mut status = ExecutionStatus {
            plan_id: Some(plan.id().to_string()),
            state,
            total: records.len(),
            ..ExecutionStatus::default()
        };
        for record in records.values() {
            match record.state {
                TaskState::Pending => status.pending += 1,
                TaskState::Running => status.running += 1,
                TaskState::Completed => status.completed += 1,
                TaskState::Failed => status.failed += 1,
                TaskState::Skipped => status.skipped += 1,
            }
        }
        *self.status.write() = status;
    }

    async fn publish_event(&self, event_type: &str, payload: serde_json::Value) {
        let result = self
            .bus
            .publish(
                event_type,
                payload,
                PublishOptions::with_priority(Priority::High).from_source("coordinator"),
            )
            .await;
        if let Err(e) = result {
            debug!(event_type, error = %e, "Lifecycle event dropped");
        }
    }
}
