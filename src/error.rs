use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConvoyError {
    #[error("Subscriber '{subscriber}' failed handling '{event_type}': {message}")]
    Subscriber {
        subscriber: String,
        event_type: String,
        message: String,
    },

    #[error("Request timed out after {timeout_ms}ms")]
    RequestTimeout { timeout_ms: u64 },

    #[error("Request handler failed: {0}")]
    RequestHandler(String),

    #[error("Cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Plan validation failed: {0}")]
    PlanValidation(String),

    #[error("Task '{task_id}' failed: {message}")]
    TaskFailed { task_id: String, message: String },

    #[error("Execution already in progress for plan: {0}")]
    ExecutionInProgress(String),

    #[error("Iteration not found: {0}")]
    IterationNotFound(String),

    #[error("Invalid phase transition: {from} -> {to} (allowed: {allowed})")]
    InvalidPhaseTransition {
        from: String,
        to: String,
        allowed: String,
    },

    #[error("Escalation required: {summary}")]
    Escalation { summary: String },

    #[error("Blocker not found: {0}")]
    BlockerNotFound(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Runtime is shutting down")]
    Shutdown,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConvoyError>;

pub(crate) fn store_err(msg: impl Into<String>) -> ConvoyError {
    ConvoyError::Store(msg.into())
}

pub(crate) fn store_err_with(msg: &str, e: impl std::fmt::Display) -> ConvoyError {
    ConvoyError::Store(format!("{}: {}", msg, e))
}
