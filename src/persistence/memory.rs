//! In-memory store for tests and persistence-free deployments.

use async_trait::async_trait;
use dashmap::DashMap;

use super::StateStore;
use crate::error::Result;

#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<(String, String), serde_json::Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn put(&self, namespace: &str, key: &str, value: serde_json::Value) -> Result<()> {
        self.entries
            .insert((namespace.to_string(), key.to_string()), value);
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self
            .entries
            .get(&(namespace.to_string(), key.to_string()))
            .map(|e| e.value().clone()))
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        Ok(self
            .entries
            .remove(&(namespace.to_string(), key.to_string()))
            .is_some())
    }

    async fn list(&self, namespace: &str) -> Result<Vec<(String, serde_json::Value)>> {
        let mut rows: Vec<(String, serde_json::Value)> = self
            .entries
            .iter()
            .filter(|e| e.key().0 == namespace)
            .map(|e| (e.key().1.clone(), e.value().clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(rows)
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
