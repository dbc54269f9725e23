//! Pending request table for request/response rendezvous.
//!
//! One entry per outstanding `request()` call. The first `respond()` removes
//! the entry and completes the caller's oneshot; later responders observe an
//! unknown id and no-op.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::oneshot;

use super::message::RequestId;
use crate::error::{ConvoyError, Result};

pub(super) struct PendingRequest {
    /// Registration time, kept for diagnostics when draining on shutdown.
    #[allow(dead_code)]
    pub created_at: DateTime<Utc>,
    tx: oneshot::Sender<Result<serde_json::Value>>,
}

#[derive(Default)]
pub(super) struct RequestTable {
    pending: DashMap<RequestId, PendingRequest>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: RequestId) -> oneshot::Receiver<Result<serde_json::Value>> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingRequest {
                created_at: Utc::now(),
                tx,
            },
        );
        rx
    }

    /// Complete a request with a payload. Returns false if the id is unknown
    /// or already resolved.
    pub fn resolve(&self, id: &RequestId, payload: serde_json::Value) -> bool {
        match self.pending.remove(id) {
            Some((_, entry)) => entry.tx.send(Ok(payload)).is_ok(),
            None => false,
        }
    }

    /// Fail a request with an error. Returns false if the id is unknown.
    pub fn reject(&self, id: &RequestId, error: ConvoyError) -> bool {
        match self.pending.remove(id) {
            Some((_, entry)) => entry.tx.send(Err(error)).is_ok(),
            None => false,
        }
    }

    /// Drop a pending entry without completing it (caller timed out).
    pub fn remove(&self, id: &RequestId) {
        self.pending.remove(id);
    }

    pub fn is_pending(&self, id: &RequestId) -> bool {
        self.pending.contains_key(id)
    }

    /// Reject every outstanding request. Used on shutdown.
    pub fn reject_all(&self) -> usize {
        let ids: Vec<RequestId> = self.pending.iter().map(|e| *e.key()).collect();
        let mut rejected = 0;
        for id in ids {
            if self.reject(&id, ConvoyError::Shutdown) {
                rejected += 1;
            }
        }
        rejected
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}
