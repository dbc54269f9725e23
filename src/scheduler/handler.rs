//! Handler traits supplied by the embedding orchestrator.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::plan::Task;
use crate::bus::EventBus;
use crate::error::Result;

/// Execution context handed to a task handler. Handlers communicate only
/// through the bus.
#[derive(Clone)]
pub struct TaskContext {
    pub bus: EventBus,
    /// 1-based attempt number, incremented on retry.
    pub attempt: u32,
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, task: &Task, ctx: TaskContext) -> Result<serde_json::Value>;
}

struct FnTaskHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnTaskHandler<F>
where
    F: Fn(Task, TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value>> + Send,
{
    async fn run(&self, task: &Task, ctx: TaskContext) -> Result<serde_json::Value> {
        (self.0)(task.clone(), ctx).await
    }
}

/// Wrap an async closure as a [`TaskHandler`].
pub fn task_handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(Task, TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
{
    Arc::new(FnTaskHandler(f))
}

/// Fallback for categories without a registered handler. Succeeds with a
/// null payload so unhandled categories degrade instead of failing plans.
pub(super) struct PassthroughHandler;

#[async_trait]
impl TaskHandler for PassthroughHandler {
    async fn run(&self, task: &Task, _ctx: TaskContext) -> Result<serde_json::Value> {
        debug!(
            task_id = task.id,
            category = task.category,
            "No handler registered, passing through"
        );
        Ok(serde_json::Value::Null)
    }
}

/// One-time initialization hook for a registered agent.
#[async_trait]
pub trait AgentLoader: Send + Sync {
    async fn load(&self) -> Result<()>;
}

struct FnAgentLoader<F>(F);

#[async_trait]
impl<F, Fut> AgentLoader for FnAgentLoader<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn load(&self) -> Result<()> {
        (self.0)().await
    }
}

/// Wrap an async closure as an [`AgentLoader`].
pub fn agent_loader_fn<F, Fut>(f: F) -> Arc<dyn AgentLoader>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnAgentLoader(f))
}

#[derive(Clone)]
pub(super) struct AgentDefinition {
    pub id: String,
    pub dependencies: Vec<String>,
    pub loader: Arc<dyn AgentLoader>,
}
