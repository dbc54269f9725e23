//! Priority-queued publish/subscribe bus with broadcast channels,
//! request/response rendezvous, and crash-recoverable persistence.
//!
//! Dispatch is logically single-threaded: one message is fully dispatched
//! (all subscribers invoked, in registration order) before the next is
//! popped from the highest-priority non-empty queue.

mod history;
mod message;
mod queues;
mod registry;
mod request;

pub use history::{HistoryFilter, MessageHistory};
pub use message::{Message, MessageId, MessageStatus, Priority, RequestId, PRIORITY_TIERS};
pub use queues::PriorityQueueSet;
pub use registry::{handler_fn, EventHandler, SubscriptionId, SubscriptionRegistry};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::BusConfig;
use crate::error::{ConvoyError, Result};
use crate::persistence::{namespaces, StateStore};
use request::RequestTable;

/// Event type used for subscriber failure reports emitted by the bus itself.
pub const BUS_ERROR_EVENT: &str = "bus.error";

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub priority: Priority,
    /// Durably record the message before enqueueing it, so it can be
    /// replayed after a crash.
    pub persist: bool,
    /// Name of the publishing agent, recorded for history filtering.
    pub source: Option<String>,
}

impl PublishOptions {
    pub fn with_priority(priority: Priority) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }

    pub fn persisted(mut self) -> Self {
        self.persist = true;
        self
    }

    pub fn from_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Counters and gauges exposed by [`EventBus::get_stats`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BusStats {
    pub published: u64,
    pub processed: u64,
    pub failed_dispatches: u64,
    pub requests: u64,
    pub broadcasts: u64,
    pub queue_depths: [usize; PRIORITY_TIERS],
    pub subscribers: usize,
    pub broadcast_subscribers: usize,
    pub pending_requests: usize,
    pub paused: bool,
}

#[derive(Default)]
struct BusCounters {
    published: AtomicU64,
    processed: AtomicU64,
    failed_dispatches: AtomicU64,
    requests: AtomicU64,
    broadcasts: AtomicU64,
}

struct BusInner {
    queues: Mutex<PriorityQueueSet>,
    registry: SubscriptionRegistry,
    requests: RequestTable,
    history: Mutex<MessageHistory>,
    store: Option<Arc<dyn StateStore>>,
    notify: Notify,
    paused: AtomicBool,
    shutting_down: AtomicBool,
    counters: BusCounters,
    config: BusConfig,
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
    dispatcher: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_store(config: BusConfig, store: Arc<dyn StateStore>) -> Self {
        Self::build(config, Some(store))
    }

    fn build(config: BusConfig, store: Option<Arc<dyn StateStore>>) -> Self {
        let max_history = config.max_history;
        Self {
            inner: Arc::new(BusInner {
                queues: Mutex::new(PriorityQueueSet::new()),
                registry: SubscriptionRegistry::new(),
                requests: RequestTable::new(),
                history: Mutex::new(MessageHistory::new(max_history)),
                store,
                notify: Notify::new(),
                paused: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                counters: BusCounters::default(),
                config,
            }),
            dispatcher: Arc::new(Mutex::new(None)),
        }
    }

    /// Spawn the dispatch loop. Idempotent; must run inside a tokio runtime.
    pub fn start(&self) {
        let mut guard = self.dispatcher.lock();
        if guard.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *guard = Some(tokio::spawn(async move {
            Self::dispatch_loop(inner).await;
        }));
        debug!("Bus dispatch loop started");
    }

    pub async fn publish(
        &self,
        event_type: impl Into<String>,
        payload: serde_json::Value,
        options: PublishOptions,
    ) -> Result<MessageId> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(ConvoyError::Shutdown);
        }

        let mut message = Message::new(event_type, payload).with_priority(options.priority);
        if let Some(source) = options.source {
            message = message.with_source(source);
        }

        if options.persist {
            self.persist_message(&mut message).await?;
        }

        let id = message.id;
        self.enqueue(message);
        Ok(id)
    }

    /// Publish a tagged message and suspend until `respond()` is called for
    /// it or the timeout elapses, whichever comes first.
    pub async fn request(
        &self,
        event_type: impl Into<String>,
        payload: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(ConvoyError::Shutdown);
        }

        let timeout = timeout
            .unwrap_or_else(|| Duration::from_millis(self.inner.config.request_timeout_ms));
        let request_id = RequestId::new();
        let rx = self.inner.requests.register(request_id);
        self.inner.counters.requests.fetch_add(1, Ordering::Relaxed);

        let message = Message::new(event_type, payload).with_request_id(request_id);
        self.enqueue(message);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConvoyError::Shutdown),
            Err(_) => {
                self.inner.requests.remove(&request_id);
                Err(ConvoyError::RequestTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Complete a pending request. A no-op (returns false) when the id is
    /// unknown or already resolved; the first responder wins.
    pub fn respond(&self, request_id: RequestId, payload: serde_json::Value) -> bool {
        self.inner.requests.resolve(&request_id, payload)
    }

    pub fn subscribe(
        &self,
        event_type: impl Into<String>,
        name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        self.inner.registry.subscribe(event_type, name, handler)
    }

    pub fn subscribe_to_broadcast(
        &self,
        channel: impl Into<String>,
        name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        self.inner.registry.subscribe_channel(channel, name, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.registry.unsubscribe(id)
    }

    /// Fan a payload out to every subscriber of a named channel. This path is
    /// independent of the typed priority queues: delivery is immediate, with
    /// the same per-subscriber error isolation as typed dispatch.
    pub async fn broadcast(
        &self,
        channel: &str,
        payload: serde_json::Value,
    ) -> Result<MessageId> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(ConvoyError::Shutdown);
        }

        let mut message = Message::new(channel, payload);
        message.status = MessageStatus::Dispatched;
        self.inner.counters.broadcasts.fetch_add(1, Ordering::Relaxed);

        let entries = self.inner.registry.channel_handlers(channel);
        let mut any_failed = false;
        for entry in entries {
            if let Err(e) = entry.handler.handle(message.clone()).await {
                any_failed = true;
                let error = ConvoyError::Subscriber {
                    subscriber: entry.name.clone(),
                    event_type: message.event_type.clone(),
                    message: e.to_string(),
                };
                Self::report_subscriber_failure(&self.inner, &entry.name, &message, &error);
            }
        }

        message.processed = true;
        message.status = if any_failed {
            MessageStatus::Failed
        } else {
            MessageStatus::Processed
        };
        let id = message.id;
        self.inner.history.lock().record(message);
        Ok(id)
    }

    /// Halt dispatch. Queued messages accumulate until `resume_dispatch`.
    pub fn pause_dispatch(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        info!("Bus dispatch paused");
    }

    pub fn resume_dispatch(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        // notify_waiters wakes a registered waiter; notify_one additionally
        // leaves a permit in case the loop has not polled yet.
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
        info!("Bus dispatch resumed");
    }

    pub fn get_history(&self, filter: &HistoryFilter) -> Vec<Message> {
        self.inner.history.lock().query(filter)
    }

    pub fn get_stats(&self) -> BusStats {
        let counters = &self.inner.counters;
        BusStats {
            published: counters.published.load(Ordering::Relaxed),
            processed: counters.processed.load(Ordering::Relaxed),
            failed_dispatches: counters.failed_dispatches.load(Ordering::Relaxed),
            requests: counters.requests.load(Ordering::Relaxed),
            broadcasts: counters.broadcasts.load(Ordering::Relaxed),
            queue_depths: self.inner.queues.lock().depths(),
            subscribers: self.inner.registry.subscriber_count(),
            broadcast_subscribers: self.inner.registry.broadcast_subscriber_count(),
            pending_requests: self.inner.requests.len(),
            paused: self.inner.paused.load(Ordering::SeqCst),
        }
    }

    /// Replay persisted messages that were never processed, in priority order
    /// then original timestamp. Messages marked processed are never replayed.
    pub async fn recover(&self) -> Result<usize> {
        let store = match self.inner.store.as_ref() {
            Some(store) => Arc::clone(store),
            None => return Ok(0),
        };

        let rows = store.list(namespaces::PENDING_MESSAGES).await?;
        let mut pending: Vec<Message> = Vec::new();
        for (key, value) in rows {
            match serde_json::from_value::<Message>(value) {
                Ok(message) => {
                    if !message.processed {
                        pending.push(message);
                    }
                }
                Err(e) => {
                    warn!(key, error = %e, "Skipping corrupt pending message");
                }
            }
        }

        pending.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
        });

        let replayed = pending.len();
        for mut message in pending {
            message.status = MessageStatus::Created;
            self.enqueue(message);
        }

        if replayed > 0 {
            info!(replayed, "Recovered unprocessed messages");
        }
        Ok(replayed)
    }

    /// Stop the dispatch loop, reject all pending requests, and flush the
    /// persistence layer.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();

        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let rejected = self.inner.requests.reject_all();
        if rejected > 0 {
            debug!(rejected, "Rejected pending requests on shutdown");
        }

        if let Some(store) = self.inner.store.as_ref() {
            store.flush().await?;
        }

        info!("Bus shut down");
        Ok(())
    }

    fn enqueue(&self, mut message: Message) {
        message.status = MessageStatus::Queued;
        self.inner.queues.lock().push(message);
        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
        self.inner.notify.notify_one();
    }

    async fn persist_message(&self, message: &mut Message) -> Result<()> {
        let store = self
            .inner
            .store
            .as_ref()
            .ok_or_else(|| ConvoyError::Store("No store configured for persist".into()))?;
        message.persisted = true;
        store
            .put(
                namespaces::PENDING_MESSAGES,
                &message.id.to_string(),
                serde_json::to_value(&*message)?,
            )
            .await
    }

    async fn dispatch_loop(inner: Arc<BusInner>) {
        loop {
            if inner.shutting_down.load(Ordering::SeqCst) {
                break;
            }

            let notified = inner.notify.notified();

            if inner.paused.load(Ordering::SeqCst) {
                notified.await;
                continue;
            }

            let message = inner.queues.lock().pop_highest();
            match message {
                Some(message) => Self::dispatch_one(&inner, message).await,
                None => notified.await,
            }
        }
        debug!("Bus dispatch loop stopped");
    }

    async fn dispatch_one(inner: &Arc<BusInner>, mut message: Message) {
        message.status = MessageStatus::Dispatched;

        let entries = inner.registry.handlers_for(&message.event_type);
        let mut handler_errors: Vec<String> = Vec::new();

        for entry in entries {
            if let Err(e) = entry.handler.handle(message.clone()).await {
                handler_errors.push(format!("{}: {}", entry.name, e));
                let error = ConvoyError::Subscriber {
                    subscriber: entry.name.clone(),
                    event_type: message.event_type.clone(),
                    message: e.to_string(),
                };
                Self::report_subscriber_failure(inner, &entry.name, &message, &error);
            }
        }

        // A responder's error propagates to the requester, unless another
        // subscriber already resolved the request.
        if let Some(request_id) = message.request_id {
            if !handler_errors.is_empty() && inner.requests.is_pending(&request_id) {
                inner.requests.reject(
                    &request_id,
                    ConvoyError::RequestHandler(handler_errors.join("; ")),
                );
            }
        }

        message.processed = true;
        message.status = if handler_errors.is_empty() {
            MessageStatus::Processed
        } else {
            MessageStatus::Failed
        };
        inner.counters.processed.fetch_add(1, Ordering::Relaxed);

        if message.persisted {
            if let Some(store) = inner.store.as_ref() {
                let ack = serde_json::to_value(&message)
                    .map_err(ConvoyError::from);
                let result = match ack {
                    Ok(value) => {
                        store
                            .put(namespaces::PENDING_MESSAGES, &message.id.to_string(), value)
                            .await
                    }
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!(message_id = %message.id, error = %e, "Failed to ack persisted message");
                }
            }
        }

        inner.history.lock().record(message);
    }

    fn report_subscriber_failure(
        inner: &Arc<BusInner>,
        subscriber: &str,
        message: &Message,
        error: &ConvoyError,
    ) {
        inner
            .counters
            .failed_dispatches
            .fetch_add(1, Ordering::Relaxed);
        warn!(
            subscriber,
            event_type = message.event_type,
            error = %error,
            "Subscriber failed, continuing dispatch"
        );

        // Failures handling the error event itself are only logged, so one
        // broken error-subscriber cannot feed the bus forever.
        if message.event_type == BUS_ERROR_EVENT {
            return;
        }

        let mut report = Message::new(
            BUS_ERROR_EVENT,
            serde_json::json!({
                "subscriber": subscriber,
                "event_type": message.event_type,
                "message_id": message.id.to_string(),
                "error": error.to_string(),
            }),
        )
        .with_priority(Priority::High);
        report.status = MessageStatus::Queued;

        inner.queues.lock().push(report);
        inner.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn started_bus() -> EventBus {
        let bus = EventBus::new(BusConfig::default());
        bus.start();
        bus
    }

    async fn drain(bus: &EventBus) {
        for _ in 0..100 {
            if bus.inner.queues.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // One extra tick so the in-flight message finishes dispatching.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_paused_bus_dispatches_in_priority_order_on_resume() {
        let bus = started_bus();
        bus.pause_dispatch();

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let order_clone = Arc::clone(&order);
        bus.subscribe(
            "step",
            "recorder",
            handler_fn(move |msg: Message| {
                let order = Arc::clone(&order_clone);
                async move {
                    order.lock().push(msg.priority);
                    Ok(())
                }
            }),
        );

        for priority in [Priority::Low, Priority::Critical, Priority::Normal] {
            bus.publish(
                "step",
                serde_json::Value::Null,
                PublishOptions::with_priority(priority),
            )
            .await
            .unwrap();
        }

        bus.resume_dispatch();
        drain(&bus).await;

        assert_eq!(
            *order.lock(),
            vec![Priority::Critical, Priority::Normal, Priority::Low]
        );
    }

    #[tokio::test]
    async fn test_subscriber_error_does_not_block_others() {
        let bus = started_bus();

        bus.subscribe(
            "evt",
            "faulty",
            handler_fn(|_msg| async {
                Err(ConvoyError::RequestHandler("boom".into()))
            }),
        );

        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        bus.subscribe(
            "evt",
            "healthy",
            handler_fn(move |_msg| {
                let ran = Arc::clone(&ran_clone);
                async move {
                    ran.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        let errors = Arc::new(AtomicUsize::new(0));
        let errors_clone = Arc::clone(&errors);
        bus.subscribe(
            BUS_ERROR_EVENT,
            "error-watcher",
            handler_fn(move |_msg| {
                let errors = Arc::clone(&errors_clone);
                async move {
                    errors.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        bus.publish("evt", serde_json::Value::Null, PublishOptions::default())
            .await
            .unwrap();
        drain(&bus).await;

        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_request_resolved_by_responder() {
        let bus = started_bus();
        let responder = bus.clone();
        bus.subscribe(
            "math.square",
            "squarer",
            handler_fn(move |msg: Message| {
                let bus = responder.clone();
                async move {
                    let n = msg.payload["n"].as_i64().unwrap_or(0);
                    if let Some(request_id) = msg.request_id {
                        bus.respond(request_id, serde_json::json!({ "result": n * n }));
                    }
                    Ok(())
                }
            }),
        );

        let result = bus
            .request(
                "math.square",
                serde_json::json!({"n": 7}),
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap();
        assert_eq!(result["result"], 49);
    }

    #[tokio::test]
    async fn test_request_timeout_distinguishable() {
        let bus = started_bus();
        let err = bus
            .request(
                "nobody.home",
                serde_json::Value::Null,
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConvoyError::RequestTimeout { .. }));
    }

    #[tokio::test]
    async fn test_request_handler_error_propagates() {
        let bus = started_bus();
        bus.subscribe(
            "will.fail",
            "bad-responder",
            handler_fn(|_msg| async { Err(ConvoyError::RequestHandler("no data".into())) }),
        );

        let err = bus
            .request(
                "will.fail",
                serde_json::Value::Null,
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConvoyError::RequestHandler(_)));
    }

    #[tokio::test]
    async fn test_respond_unknown_id_is_noop() {
        let bus = started_bus();
        assert!(!bus.respond(RequestId::new(), serde_json::Value::Null));
    }

    #[tokio::test]
    async fn test_broadcast_isolated_from_typed_path() {
        let bus = started_bus();

        let typed_hits = Arc::new(AtomicUsize::new(0));
        let typed_clone = Arc::clone(&typed_hits);
        bus.subscribe(
            "updates",
            "typed",
            handler_fn(move |_msg| {
                let hits = Arc::clone(&typed_clone);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        let channel_hits = Arc::new(AtomicUsize::new(0));
        let channel_clone = Arc::clone(&channel_hits);
        bus.subscribe_to_broadcast(
            "updates",
            "channel",
            handler_fn(move |_msg| {
                let hits = Arc::clone(&channel_clone);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        bus.broadcast("updates", serde_json::json!({"v": 1}))
            .await
            .unwrap();

        assert_eq!(channel_hits.load(Ordering::SeqCst), 1);
        assert_eq!(typed_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stats_reflect_activity() {
        let bus = started_bus();
        bus.subscribe("evt", "one", handler_fn(|_msg| async { Ok(()) }));

        bus.publish("evt", serde_json::Value::Null, PublishOptions::default())
            .await
            .unwrap();
        drain(&bus).await;

        let stats = bus.get_stats();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.subscribers, 1);
        assert!(!stats.paused);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_pending_requests() {
        let bus = started_bus();
        let requester = bus.clone();
        let pending = tokio::spawn(async move {
            requester
                .request(
                    "never.answered",
                    serde_json::Value::Null,
                    Some(Duration::from_secs(30)),
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.shutdown().await.unwrap();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, ConvoyError::Shutdown));
    }
}
