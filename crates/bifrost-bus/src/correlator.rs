//! # Request/Response Correlator
//!
//! Pending-request table. One record per in-flight request, keyed by its
//! correlation id.
//!
//! Resolution is by removal: whoever removes a record owns its callback,
//! so a record resolves at most once no matter whether the response, the
//! timeout sweep or a cancellation reaches it first.

use crate::registry::SubscriptionId;
use bifrost_types::{ApiResponse, CorrelationId};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::time::Instant;

/// Callback receiving the single response of a request.
pub type ResponseCallback = Box<dyn FnOnce(ApiResponse) + Send>;

pub(crate) struct PendingRequest {
    pub(crate) channel: String,
    /// Single-response listener registered for this request.
    pub(crate) subscription: SubscriptionId,
    pub(crate) deadline: Instant,
    pub(crate) galactic: bool,
    pub(crate) callback: ResponseCallback,
}

impl PendingRequest {
    fn info(&self, id: CorrelationId) -> PendingRequestInfo {
        PendingRequestInfo {
            correlation_id: id,
            channel: self.channel.clone(),
            galactic: self.galactic,
        }
    }
}

/// Read-only view of a pending request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequestInfo {
    pub correlation_id: CorrelationId,
    pub channel: String,
    /// Whether the request was sent over the fabric.
    pub galactic: bool,
}

#[derive(Default)]
pub(crate) struct Correlator {
    pending: Mutex<HashMap<CorrelationId, PendingRequest>>,
}

impl Correlator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Insert a record. Returns it back if the id is already pending.
    pub(crate) fn register(
        &self,
        id: CorrelationId,
        record: PendingRequest,
    ) -> Result<(), PendingRequest> {
        let mut pending = self.pending.lock();
        if pending.contains_key(&id) {
            return Err(record);
        }
        pending.insert(id, record);
        Ok(())
    }

    pub(crate) fn contains(&self, id: CorrelationId) -> bool {
        self.pending.lock().contains_key(&id)
    }

    pub(crate) fn take(&self, id: CorrelationId) -> Option<PendingRequest> {
        self.pending.lock().remove(&id)
    }

    /// Remove every record whose deadline is at or before `now`.
    pub(crate) fn take_expired(&self, now: Instant) -> Vec<(CorrelationId, PendingRequest)> {
        self.take_matching(|_, record| record.deadline <= now)
    }

    /// Remove every record `predicate` selects.
    pub(crate) fn take_where<P>(&self, predicate: P) -> Vec<(CorrelationId, PendingRequest)>
    where
        P: Fn(&PendingRequestInfo) -> bool,
    {
        self.take_matching(|id, record| predicate(&record.info(*id)))
    }

    /// Discard the records whose listener is one of `subscriptions`.
    pub(crate) fn discard_subscriptions(&self, subscriptions: &[SubscriptionId]) -> usize {
        if subscriptions.is_empty() {
            return 0;
        }
        self.take_matching(|_, record| subscriptions.contains(&record.subscription))
            .len()
    }

    /// Discard everything. Callbacks are dropped without being invoked.
    pub(crate) fn clear(&self) -> usize {
        let mut pending = self.pending.lock();
        let count = pending.len();
        pending.clear();
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub(crate) fn snapshot(&self) -> Vec<PendingRequestInfo> {
        let pending = self.pending.lock();
        let mut infos: Vec<PendingRequestInfo> =
            pending.iter().map(|(id, record)| record.info(*id)).collect();
        infos.sort_by_key(|info| *info.correlation_id.as_uuid());
        infos
    }

    fn take_matching<P>(&self, predicate: P) -> Vec<(CorrelationId, PendingRequest)>
    where
        P: Fn(&CorrelationId, &PendingRequest) -> bool,
    {
        let mut pending = self.pending.lock();
        let ids: Vec<CorrelationId> = pending
            .iter()
            .filter(|(id, record)| predicate(id, record))
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| pending.remove(&id).map(|record| (id, record)))
            .collect()
    }
}
