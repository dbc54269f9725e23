//! Subscription registry: typed event subscribers and broadcast channels.
//!
//! An explicit map from event type (or channel name) to an ordered list of
//! named handlers. Handlers for one message run in registration order.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::message::Message;
use crate::error::Result;

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, message: Message) -> Result<()> {
        (self.0)(message).await
    }
}

/// Wrap an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Clone)]
pub(super) struct SubscriptionEntry {
    pub id: SubscriptionId,
    pub name: String,
    pub handler: Arc<dyn EventHandler>,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    typed: RwLock<HashMap<String, Vec<SubscriptionEntry>>>,
    channels: RwLock<HashMap<String, Vec<SubscriptionEntry>>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn subscribe(
        &self,
        event_type: impl Into<String>,
        name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        let id = self.next_id();
        self.typed
            .write()
            .entry(event_type.into())
            .or_default()
            .push(SubscriptionEntry {
                id,
                name: name.into(),
                handler,
            });
        id
    }

    pub fn subscribe_channel(
        &self,
        channel: impl Into<String>,
        name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        let id = self.next_id();
        self.channels
            .write()
            .entry(channel.into())
            .or_default()
            .push(SubscriptionEntry {
                id,
                name: name.into(),
                handler,
            });
        id
    }

    /// Remove a subscription from either map. Returns false for unknown ids.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        for map in [&self.typed, &self.channels] {
            let mut guard = map.write();
            for entries in guard.values_mut() {
                if let Some(pos) = entries.iter().position(|e| e.id == id) {
                    entries.remove(pos);
                    return true;
                }
            }
        }
        false
    }

    pub(super) fn handlers_for(&self, event_type: &str) -> Vec<SubscriptionEntry> {
        self.typed
            .read()
            .get(event_type)
            .cloned()
            .unwrap_or_default()
    }

    pub(super) fn channel_handlers(&self, channel: &str) -> Vec<SubscriptionEntry> {
        self.channels
            .read()
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.typed.read().values().map(Vec::len).sum()
    }

    pub fn broadcast_subscriber_count(&self) -> usize {
        self.channels.read().values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn EventHandler> {
        handler_fn(|_msg| async { Ok(()) })
    }

    #[test]
    fn test_handlers_in_registration_order() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe("task.started", "first", noop());
        registry.subscribe("task.started", "second", noop());
        registry.subscribe("task.started", "third", noop());

        let names: Vec<_> = registry
            .handlers_for("task.started")
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, ["first", "second", "third"]);
    }

    #[test]
    fn test_unsubscribe_removes_only_target() {
        let registry = SubscriptionRegistry::new();
        let id = registry.subscribe("x", "a", noop());
        registry.subscribe("x", "b", noop());

        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));

        let names: Vec<_> = registry
            .handlers_for("x")
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, ["b"]);
    }

    #[test]
    fn test_typed_and_channel_counts_are_separate() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe("x", "a", noop());
        registry.subscribe_channel("updates", "b", noop());
        registry.subscribe_channel("updates", "c", noop());

        assert_eq!(registry.subscriber_count(), 1);
        assert_eq!(registry.broadcast_subscriber_count(), 2);
        assert_eq!(registry.channel_handlers("updates").len(), 2);
        assert!(registry.handlers_for("updates").is_empty());
    }
}
