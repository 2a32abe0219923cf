use crate::{Response, SdkError, SdkResult};
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::Arc;
use tokio::{sync::oneshot, time::Instant};
use tracing::{debug, warn};

/// Outstanding synchronous call
struct PendingCall {
    tx: oneshot::Sender<Response>,
    deadline: Instant,
}

/// Concurrent map from trace id to pending call.
///
/// Every operation that resolves a call removes the entry first, so a
/// response racing an expiry resolves the call exactly once.
#[derive(Default)]
pub struct CorrelationRegistry {
    pending: DashMap<String, PendingCall>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending call. Fails if `trace_id` is already outstanding.
    pub fn register(
        &self,
        trace_id: &str,
        deadline: Instant,
    ) -> SdkResult<oneshot::Receiver<Response>> {
        match self.pending.entry(trace_id.to_string()) {
            Entry::Occupied(_) => Err(SdkError::DuplicateTraceId {
                trace_id: trace_id.to_string(),
            }),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(PendingCall { tx, deadline });
                Ok(rx)
            }
        }
    }

    /// Fulfil a pending call. Returns `false` for unknown, late or duplicate ids.
    pub fn complete(&self, trace_id: &str, response: Response) -> bool {
        let Some((_, call)) = self.pending.remove(trace_id) else {
            debug!(trace_id, "Discarding response without pending call");
            return false;
        };
        if call.tx.send(response).is_err() {
            debug!(trace_id, "Caller dropped before response arrived");
        }
        true
    }

    /// Fail a pending call with a timeout response.
    pub fn expire(&self, trace_id: &str) -> bool {
        let Some((_, call)) = self.pending.remove(trace_id) else {
            return false;
        };
        let timeout = SdkError::Timeout {
            trace_id: trace_id.to_string(),
        };
        let _ = call.tx.send(Response::from_error(&timeout));
        true
    }

    /// Drop a pending call without resolving it; used to roll back a
    /// registration whose publish failed.
    pub fn remove(&self, trace_id: &str) -> bool {
        self.pending.remove(trace_id).is_some()
    }

    /// Expire every call whose deadline has passed. Returns the number expired.
    pub fn expire_overdue(&self, now: Instant) -> usize {
        let overdue: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| entry.key().clone())
            .collect();
        overdue.iter().filter(|id| self.expire(id)).count()
    }

    /// Fail every outstanding call with `reason` and clear the map.
    pub fn cancel_all(&self, reason: &SdkError) -> usize {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let response = Response::from_error(reason);
        let mut cancelled = 0;
        for id in ids {
            if let Some((_, call)) = self.pending.remove(&id) {
                let _ = call.tx.send(response.clone());
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            warn!(cancelled, reason = %reason, "Cancelled pending calls");
        }
        cancelled
    }

    #[inline]
    pub fn contains(&self, trace_id: &str) -> bool {
        self.pending.contains_key(trace_id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Removes a registration when the waiting caller goes away early.
pub(crate) struct PendingGuard {
    registry: Arc<CorrelationRegistry>,
    trace_id: String,
}

impl PendingGuard {
    pub(crate) fn new(registry: Arc<CorrelationRegistry>, trace_id: String) -> Self {
        Self { registry, trace_id }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.trace_id);
    }
}
