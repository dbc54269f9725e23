//! Pluggable persistence: a namespaced key/value store used for recovery,
//! never as a primary data path.

mod memory;
mod snapshot;
mod sqlite;

pub use memory::MemoryStore;
pub use snapshot::{SnapshotStore, StateSnapshot};
pub use sqlite::SqliteStore;

use async_trait::async_trait;

use crate::error::Result;

/// Well-known store namespaces.
pub mod namespaces {
    pub const PENDING_MESSAGES: &str = "pending_messages";
    pub const AGENT_STATE: &str = "agent_state";
    pub const DECISIONS: &str = "decisions";
}

/// Durable key/value store with string namespaces. Implementations must be
/// safe for concurrent use; values are opaque JSON.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn put(&self, namespace: &str, key: &str, value: serde_json::Value) -> Result<()>;

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<serde_json::Value>>;

    /// Returns true when the key existed.
    async fn delete(&self, namespace: &str, key: &str) -> Result<bool>;

    /// All entries in a namespace, ordered by key.
    async fn list(&self, namespace: &str) -> Result<Vec<(String, serde_json::Value)>>;

    /// Flush any buffered writes to durable storage.
    async fn flush(&self) -> Result<()>;
}
