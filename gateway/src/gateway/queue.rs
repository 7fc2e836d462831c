//! Bounded priority queue of admitted requests.
//!
//! Items are ordered by `(priority, sequence)`: lower priority values are
//! served first, and the admission sequence keeps equal priorities FIFO.
//! A dispatcher *claims* an item while it looks for a worker; the claimed
//! item stays in the queue (and counts against capacity) but no other
//! dispatcher can see it. Once a worker is chosen the item is taken out of
//! the queue and tracked as in flight until the dispatcher finishes it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{oneshot, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use super::payload::{DispatchOutcome, InferencePayload};
use crate::error::GatewayError;
use crate::metrics::Metrics;

pub type RequestId = Uuid;

pub type DispatchResult = Result<DispatchOutcome, GatewayError>;

type ResultSender = oneshot::Sender<DispatchResult>;

/// Ordering key: (priority, admission sequence).
type Key = (u8, u64);

struct QueueItem {
    id: RequestId,
    payload: Arc<InferencePayload>,
    priority: u8,
    enqueued_at: Instant,
    deadline: Option<Instant>,
    attempts: u32,
    not_before: Option<Instant>,
    claimed: bool,
    result_tx: ResultSender,
}

impl QueueItem {
    fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }

    fn ready(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |at| at <= now)
    }

    fn resolve(self, result: DispatchResult) {
        // The caller may already be gone.
        let _ = self.result_tx.send(result);
    }
}

#[derive(Default)]
struct QueueState {
    items: BTreeMap<Key, QueueItem>,
    index: HashMap<RequestId, Key>,
    in_flight: HashMap<RequestId, Arc<Notify>>,
    next_seq: u64,
    shutting_down: bool,
}

impl QueueState {
    fn remove(&mut self, id: &RequestId) -> Option<QueueItem> {
        let key = self.index.remove(id)?;
        self.items.remove(&key)
    }

    fn remove_key(&mut self, key: &Key) -> Option<QueueItem> {
        let item = self.items.remove(key)?;
        self.index.remove(&item.id);
        Some(item)
    }
}

/// A request to admit into the queue.
pub struct NewRequest {
    pub payload: InferencePayload,
    pub priority: u8,
    pub deadline: Option<Instant>,
}

/// Caller side of an admitted request.
///
/// Dropping the handle abandons the request: queued items are discarded and
/// in-flight worker calls are aborted.
#[derive(Debug)]
pub struct RequestHandle {
    pub id: RequestId,
    receiver: oneshot::Receiver<DispatchResult>,
}

impl RequestHandle {
    /// Wait for the result for at most `timeout`.
    pub async fn wait(self, timeout: Duration) -> DispatchResult {
        match tokio::time::timeout(timeout, self.receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::Internal(
                "request was dropped without a result".to_string(),
            )),
            Err(_) => Err(GatewayError::Timeout(format!(
                "no result within {} ms",
                timeout.as_millis()
            ))),
        }
    }
}

/// An item claimed by a dispatcher.
#[derive(Debug, Clone)]
pub struct ClaimedItem {
    pub id: RequestId,
    pub payload: Arc<InferencePayload>,
    pub priority: u8,
    pub enqueued_at: Instant,
    pub deadline: Option<Instant>,
    /// Failed attempts so far.
    pub attempts: u32,
}

/// An item taken out of the queue for a worker call.
pub struct InFlight {
    pub result_tx: oneshot::Sender<DispatchResult>,
    /// Fired by [`RequestQueue::cancel`].
    pub cancel: Arc<Notify>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The item was still queued and has been discarded.
    Removed,
    /// The item is with a worker; its call has been told to abort.
    Signalled,
    NotFound,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub depth: usize,
    pub capacity: usize,
    pub claimed: usize,
    pub in_flight: usize,
    pub by_priority: BTreeMap<u8, usize>,
    pub oldest_age_ms: Option<u64>,
    pub shutting_down: bool,
}

pub struct RequestQueue {
    state: Mutex<QueueState>,
    ready: Notify,
    capacity: usize,
    metrics: Metrics,
}

impl RequestQueue {
    pub fn new(capacity: usize, metrics: Metrics) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            ready: Notify::new(),
            capacity,
            metrics,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Admit a request. The capacity check and the insertion happen under one lock.
    pub async fn enqueue(&self, request: NewRequest) -> Result<RequestHandle, GatewayError> {
        let (result_tx, receiver) = oneshot::channel();
        let id = Uuid::new_v4();

        let mut state = self.state.lock().await;
        if state.shutting_down {
            return Err(GatewayError::ShuttingDown);
        }
        if state.items.len() >= self.capacity {
            return Err(GatewayError::QueueFull {
                capacity: self.capacity,
            });
        }

        let key = (request.priority, state.next_seq);
        state.next_seq += 1;
        state.items.insert(
            key,
            QueueItem {
                id,
                payload: Arc::new(request.payload),
                priority: request.priority,
                enqueued_at: Instant::now(),
                deadline: request.deadline,
                attempts: 0,
                not_before: None,
                claimed: false,
                result_tx,
            },
        );
        state.index.insert(id, key);
        self.metrics.queue_depth.set(state.items.len() as i64);
        drop(state);

        self.ready.notify_one();
        Ok(RequestHandle { id, receiver })
    }

    /// Claim the highest-precedence ready item, waiting until one exists.
    ///
    /// Returns `None` once the queue is shut down. Expired items met on the
    /// way are failed with `Timeout`; abandoned ones are dropped.
    pub async fn claim_next(&self) -> Option<ClaimedItem> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.state.lock().await;
                if state.shutting_down {
                    return None;
                }

                let now = Instant::now();
                let mut expired = Vec::new();
                let mut abandoned = Vec::new();
                let mut picked = None;
                let mut wake_at: Option<Instant> = None;

                for (key, item) in state.items.iter() {
                    if item.claimed {
                        continue;
                    }
                    if item.result_tx.is_closed() {
                        abandoned.push(*key);
                    } else if item.expired(now) {
                        expired.push(*key);
                    } else if !item.ready(now) {
                        wake_at = match (wake_at, item.not_before) {
                            (Some(a), Some(b)) => Some(a.min(b)),
                            (a, b) => a.or(b),
                        };
                    } else {
                        picked = Some(*key);
                        break;
                    }
                }

                for key in &abandoned {
                    state.remove_key(key);
                }
                for key in &expired {
                    if let Some(item) = state.remove_key(key) {
                        tracing::debug!(request_id = %item.id, "Request expired in queue");
                        item.resolve(Err(GatewayError::Timeout(
                            "deadline passed while queued".to_string(),
                        )));
                    }
                }
                if !abandoned.is_empty() || !expired.is_empty() {
                    self.metrics.queue_depth.set(state.items.len() as i64);
                }

                if let Some(item) = picked.and_then(|key| state.items.get_mut(&key)) {
                    item.claimed = true;
                    return Some(ClaimedItem {
                        id: item.id,
                        payload: item.payload.clone(),
                        priority: item.priority,
                        enqueued_at: item.enqueued_at,
                        deadline: item.deadline,
                        attempts: item.attempts,
                    });
                }
                wake_at
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Return a claimed item to the queue after a failed routing attempt.
    ///
    /// The item keeps its ordering key and becomes claimable again after `backoff`.
    pub async fn requeue(&self, id: RequestId, backoff: Duration) -> bool {
        let mut state = self.state.lock().await;
        let Some(key) = state.index.get(&id).copied() else {
            return false;
        };
        let Some(item) = state.items.get_mut(&key) else {
            return false;
        };
        item.claimed = false;
        item.attempts += 1;
        item.not_before = Some(Instant::now() + backoff);
        drop(state);

        self.ready.notify_one();
        true
    }

    /// Remove a claimed item and resolve it with `error`.
    pub async fn fail(&self, id: RequestId, error: GatewayError) -> bool {
        let mut state = self.state.lock().await;
        let Some(item) = state.remove(&id) else {
            return false;
        };
        self.metrics.queue_depth.set(state.items.len() as i64);
        drop(state);

        item.resolve(Err(error));
        true
    }

    /// Take a claimed item out of the queue for a worker call.
    ///
    /// Returns `None` if the item was cancelled or shut down meanwhile.
    pub async fn take_for_dispatch(&self, id: RequestId) -> Option<InFlight> {
        let mut state = self.state.lock().await;
        let item = state.remove(&id)?;
        let cancel = Arc::new(Notify::new());
        state.in_flight.insert(id, cancel.clone());
        self.metrics.queue_depth.set(state.items.len() as i64);

        Some(InFlight {
            result_tx: item.result_tx,
            cancel,
        })
    }

    /// Forget an in-flight item once its dispatcher is done with it.
    pub async fn finish(&self, id: RequestId) {
        self.state.lock().await.in_flight.remove(&id);
    }

    pub async fn cancel(&self, id: RequestId) -> CancelOutcome {
        let mut state = self.state.lock().await;
        if let Some(item) = state.remove(&id) {
            self.metrics.queue_depth.set(state.items.len() as i64);
            drop(state);
            item.resolve(Err(GatewayError::Cancelled));
            return CancelOutcome::Removed;
        }
        if let Some(signal) = state.in_flight.get(&id) {
            // notify_one keeps a permit if the dispatcher is not waiting yet.
            signal.notify_one();
            return CancelOutcome::Signalled;
        }
        CancelOutcome::NotFound
    }

    /// Fail every unclaimed item whose deadline has passed. Returns how many expired.
    pub async fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now()).await
    }

    pub async fn purge_expired_at(&self, now: Instant) -> usize {
        let mut state = self.state.lock().await;
        let stale: Vec<Key> = state
            .items
            .iter()
            .filter(|(_, item)| !item.claimed && (item.expired(now) || item.result_tx.is_closed()))
            .map(|(key, _)| *key)
            .collect();
        if stale.is_empty() {
            return 0;
        }

        let removed: Vec<QueueItem> = stale.iter().filter_map(|key| state.remove_key(key)).collect();
        self.metrics.queue_depth.set(state.items.len() as i64);
        drop(state);

        let mut expired = 0;
        for item in removed {
            if item.expired(now) {
                expired += 1;
                item.resolve(Err(GatewayError::Timeout(
                    "deadline passed while queued".to_string(),
                )));
            }
        }
        expired
    }

    /// Run [`Self::purge_expired`] every `period` until `shutdown` fires.
    pub fn spawn_purger(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let expired = self.purge_expired().await;
                        if expired > 0 {
                            tracing::debug!(expired, "Purged expired requests");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("Queue purger stopped");
        })
    }

    pub async fn status(&self) -> QueueStatus {
        let state = self.state.lock().await;
        let now = Instant::now();
        let mut by_priority = BTreeMap::new();
        let mut claimed = 0;
        let mut oldest: Option<Instant> = None;
        for item in state.items.values() {
            *by_priority.entry(item.priority).or_insert(0) += 1;
            if item.claimed {
                claimed += 1;
            }
            oldest = Some(oldest.map_or(item.enqueued_at, |o| o.min(item.enqueued_at)));
        }

        QueueStatus {
            depth: state.items.len(),
            capacity: self.capacity,
            claimed,
            in_flight: state.in_flight.len(),
            by_priority,
            oldest_age_ms: oldest.map(|o| now.saturating_duration_since(o).as_millis() as u64),
            shutting_down: state.shutting_down,
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn is_shutting_down(&self) -> bool {
        self.state.lock().await.shutting_down
    }

    /// Stop admitting, fail everything still queued, and release the dispatchers.
    ///
    /// In-flight worker calls are left to finish.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if state.shutting_down {
            return;
        }
        state.shutting_down = true;
        let items = std::mem::take(&mut state.items);
        state.index.clear();
        self.metrics.queue_depth.set(0);
        drop(state);

        let dropped = items.len();
        for item in items.into_values() {
            item.resolve(Err(GatewayError::ShuttingDown));
        }
        self.ready.notify_waiters();
        tracing::info!(dropped, "Request queue shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::chat_payload;

    fn queue(capacity: usize) -> RequestQueue {
        RequestQueue::new(capacity, Metrics::new().unwrap())
    }

    fn request(priority: u8) -> NewRequest {
        NewRequest {
            payload: chat_payload("m"),
            priority,
            deadline: None,
        }
    }

    async fn claim_within(queue: &RequestQueue, ms: u64) -> Option<ClaimedItem> {
        tokio::time::timeout(Duration::from_millis(ms), queue.claim_next())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_priority_then_fifo_order() {
        let queue = queue(10);
        let a = queue.enqueue(request(5)).await.unwrap();
        let b = queue.enqueue(request(1)).await.unwrap();
        let c = queue.enqueue(request(5)).await.unwrap();

        let order: Vec<RequestId> = vec![
            queue.claim_next().await.unwrap().id,
            queue.claim_next().await.unwrap().id,
            queue.claim_next().await.unwrap().id,
        ];
        assert_eq!(order, vec![b.id, a.id, c.id]);
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let queue = queue(2);
        let _a = queue.enqueue(request(5)).await.unwrap();
        let _b = queue.enqueue(request(5)).await.unwrap();
        assert_eq!(
            queue.enqueue(request(0)).await.unwrap_err(),
            GatewayError::QueueFull { capacity: 2 }
        );

        // A claimed item still counts against capacity.
        let claimed = queue.claim_next().await.unwrap();
        assert!(queue.enqueue(request(5)).await.is_err());

        // Taking it for dispatch frees the slot.
        let _in_flight = queue.take_for_dispatch(claimed.id).await.unwrap();
        assert!(queue.enqueue(request(5)).await.is_ok());
        assert_eq!(queue.len().await, 2);
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_unique() {
        let queue = Arc::new(queue(100));
        let mut handles = Vec::new();
        for _ in 0..50 {
            handles.push(queue.enqueue(request(3)).await.unwrap());
        }

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let queue = queue.clone();
            tasks.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(item) = claim_within(&queue, 50).await {
                    seen.push(item.id);
                    queue.take_for_dispatch(item.id).await.unwrap();
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for task in tasks {
            all.extend(task.await.unwrap());
        }
        let unique: std::collections::HashSet<_> = all.iter().collect();
        assert_eq!(all.len(), 50);
        assert_eq!(unique.len(), 50);
    }

    #[tokio::test]
    async fn test_claimed_item_invisible_to_others() {
        let queue = queue(10);
        let _h = queue.enqueue(request(5)).await.unwrap();
        let _first = queue.claim_next().await.unwrap();
        assert!(claim_within(&queue, 20).await.is_none());
    }

    #[tokio::test]
    async fn test_requeue_applies_backoff_and_keeps_order() {
        let queue = queue(10);
        let first = queue.enqueue(request(1)).await.unwrap();

        let claimed = queue.claim_next().await.unwrap();
        assert!(queue.requeue(claimed.id, Duration::from_millis(100)).await);

        // Not claimable until the backoff elapses.
        assert!(claim_within(&queue, 20).await.is_none());

        let again = claim_within(&queue, 500).await.unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.attempts, 1);
    }

    #[tokio::test]
    async fn test_cancel_queued_item() {
        let queue = queue(10);
        let handle = queue.enqueue(request(5)).await.unwrap();
        assert_eq!(queue.cancel(handle.id).await, CancelOutcome::Removed);
        assert_eq!(
            handle.wait(Duration::from_secs(1)).await.unwrap_err(),
            GatewayError::Cancelled
        );
        assert!(queue.is_empty().await);
        assert_eq!(queue.cancel(Uuid::new_v4()).await, CancelOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_cancel_in_flight_signals_dispatcher() {
        let queue = queue(10);
        let handle = queue.enqueue(request(5)).await.unwrap();
        let claimed = queue.claim_next().await.unwrap();
        let in_flight = queue.take_for_dispatch(claimed.id).await.unwrap();

        assert_eq!(queue.cancel(handle.id).await, CancelOutcome::Signalled);
        tokio::time::timeout(Duration::from_secs(1), in_flight.cancel.notified())
            .await
            .unwrap();

        queue.finish(handle.id).await;
        assert_eq!(queue.cancel(handle.id).await, CancelOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_expired_items_fail_with_timeout() {
        let queue = queue(10);
        let handle = queue
            .enqueue(NewRequest {
                payload: chat_payload("m"),
                priority: 5,
                deadline: Some(Instant::now() + Duration::from_millis(10)),
            })
            .await
            .unwrap();

        assert_eq!(queue.purge_expired_at(Instant::now()).await, 0);
        assert_eq!(
            queue.purge_expired_at(Instant::now() + Duration::from_millis(20)).await,
            1
        );
        assert!(matches!(
            handle.wait(Duration::from_secs(1)).await,
            Err(GatewayError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_abandoned_items_are_skipped() {
        let queue = queue(10);
        let dropped = queue.enqueue(request(0)).await.unwrap();
        let kept = queue.enqueue(request(5)).await.unwrap();
        drop(dropped);

        assert_eq!(queue.claim_next().await.unwrap().id, kept.id);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_shutdown_fails_queued_and_rejects_new() {
        let queue = queue(10);
        let handle = queue.enqueue(request(5)).await.unwrap();

        queue.shutdown().await;

        assert_eq!(
            handle.wait(Duration::from_secs(1)).await.unwrap_err(),
            GatewayError::ShuttingDown
        );
        assert_eq!(
            queue.enqueue(request(5)).await.unwrap_err(),
            GatewayError::ShuttingDown
        );
        assert!(queue.claim_next().await.is_none());
        assert!(queue.status().await.shutting_down);
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiting_claimers() {
        let queue = Arc::new(queue(10));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.claim_next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.shutdown().await;

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_status_reports_counts() {
        let metrics = Metrics::new().unwrap();
        let queue = RequestQueue::new(10, metrics.clone());
        let _a = queue.enqueue(request(1)).await.unwrap();
        let _b = queue.enqueue(request(5)).await.unwrap();
        let _c = queue.enqueue(request(5)).await.unwrap();
        let claimed = queue.claim_next().await.unwrap();
        let _in_flight = queue.take_for_dispatch(claimed.id).await.unwrap();
        let _claimed = queue.claim_next().await.unwrap();

        let status = queue.status().await;
        assert_eq!(status.depth, 2);
        assert_eq!(status.claimed, 1);
        assert_eq!(status.in_flight, 1);
        assert_eq!(status.by_priority.get(&5), Some(&2));
        assert!(status.oldest_age_ms.is_some());
        assert_eq!(metrics.queue_depth.get(), 2);
    }
}
