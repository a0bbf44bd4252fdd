//! Live fan-out of operation lifecycle events.
//!
//! Publishing only enqueues into each subscriber's bounded buffer and signals
//! its reader, so the oplog commit path completes in bounded time. A slow
//! subscriber loses its oldest events and receives a single [`OperationEvent::Lost`]
//! marker before the next delivery; it can re-sync by scanning
//! `OpLog::for_each(last_seen_id, ...)`.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use warden_core::Operation;

use crate::store::OpLog;

/// Default per-subscriber buffer capacity.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 128;

/// Phase tags emitted around the logical phases of a backup, consumed by an
/// external hook runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HookPhase {
    SnapshotStart,
    SnapshotEnd,
    SnapshotError,
    PruneStart,
    PruneEnd,
}

impl std::fmt::Display for HookPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SnapshotStart => write!(f, "SNAPSHOT_START"),
            Self::SnapshotEnd => write!(f, "SNAPSHOT_END"),
            Self::SnapshotError => write!(f, "SNAPSHOT_ERROR"),
            Self::PruneStart => write!(f, "PRUNE_START"),
            Self::PruneEnd => write!(f, "PRUNE_END"),
        }
    }
}

/// One operation lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OperationEvent {
    Created { op: Operation },
    Updated { op: Operation },
    Deleted { id: i64 },
    Hook { phase: HookPhase, op_id: i64 },
    /// Events were dropped for this subscriber; re-sync from the oplog.
    Lost,
}

struct SubscriberState {
    queue: VecDeque<OperationEvent>,
    capacity: usize,
    lost: bool,
    notify: Arc<Notify>,
}

struct BrokerInner {
    subscribers: Mutex<HashMap<u64, Arc<Mutex<SubscriberState>>>>,
    next_id: AtomicU64,
}

/// Single-process event fan-out with per-subscriber bounded buffers.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a new subscriber with the default buffer capacity.
    pub fn subscribe(&self) -> EventStream {
        self.subscribe_with_capacity(DEFAULT_SUBSCRIBER_BUFFER)
    }

    pub fn subscribe_with_capacity(&self, capacity: usize) -> EventStream {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let notify = Arc::new(Notify::new());
        let state = Arc::new(Mutex::new(SubscriberState {
            queue: VecDeque::with_capacity(capacity.min(64)),
            capacity: capacity.max(1),
            lost: false,
            notify: notify.clone(),
        }));
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, state.clone());
        EventStream {
            id,
            state,
            notify,
            broker: Arc::downgrade(&self.inner),
        }
    }

    /// Enqueue `event` for every live subscriber. Completes in bounded time;
    /// full buffers drop their oldest entry and mark the subscriber lost.
    pub fn publish(&self, event: OperationEvent) {
        let subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for state in subscribers.values() {
            let mut st = state.lock().unwrap_or_else(|e| e.into_inner());
            if st.queue.len() >= st.capacity {
                st.queue.pop_front();
                st.lost = true;
            }
            st.queue.push_back(event.clone());
            st.notify.notify_one();
        }
    }

    /// Bridge oplog commits into broker events. The returned handle keeps the
    /// subscription alive for the oplog's lifetime.
    pub fn attach(&self, oplog: &OpLog) -> crate::store::SubscriptionHandle {
        let broker = self.clone();
        oplog.subscribe(Box::new(move |old, new| {
            let event = match (old, new) {
                (None, Some(op)) => OperationEvent::Created { op: op.clone() },
                (Some(_), Some(op)) => OperationEvent::Updated { op: op.clone() },
                (Some(op), None) => OperationEvent::Deleted { id: op.id },
                (None, None) => return,
            };
            broker.publish(event);
        }))
    }

}

/// Receiving side of a subscription. Dropping it unsubscribes.
pub struct EventStream {
    id: u64,
    state: Arc<Mutex<SubscriberState>>,
    notify: Arc<Notify>,
    broker: std::sync::Weak<BrokerInner>,
}

impl EventStream {
    /// Wait for the next event. A `Lost` marker is always delivered before
    /// any event that follows dropped ones.
    pub async fn recv(&mut self) -> OperationEvent {
        loop {
            {
                let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if st.lost {
                    st.lost = false;
                    return OperationEvent::Lost;
                }
                if let Some(event) = st.queue.pop_front() {
                    return event;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<OperationEvent> {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if st.lost {
            st.lost = false;
            return Some(OperationEvent::Lost);
        }
        st.queue.pop_front()
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if let Some(inner) = self.broker.upgrade() {
            inner
                .subscribers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::{Operation, OperationKind};

    fn event(id: i64) -> OperationEvent {
        let mut op = Operation::new("r1", "p1", OperationKind::Backup { last_status: None });
        op.id = id;
        OperationEvent::Created { op }
    }

    #[tokio::test]
    async fn test_publish_and_recv_in_order() {
        let broker = Broker::new();
        let mut stream = broker.subscribe();

        broker.publish(event(1));
        broker.publish(event(2));

        assert_eq!(stream.recv().await, event(1));
        assert_eq!(stream.recv().await, event(2));
    }

    #[tokio::test]
    async fn test_slow_subscriber_gets_lost_marker() {
        let broker = Broker::new();
        let mut stream = broker.subscribe_with_capacity(2);

        broker.publish(event(1));
        broker.publish(event(2));
        broker.publish(event(3));

        // Oldest dropped; the marker precedes everything still buffered.
        assert_eq!(stream.recv().await, OperationEvent::Lost);
        assert_eq!(stream.recv().await, event(2));
        assert_eq!(stream.recv().await, event(3));
    }

    #[tokio::test]
    async fn test_dropped_stream_unsubscribes() {
        let broker = Broker::new();
        let stream = broker.subscribe();
        drop(stream);

        // Publishing to nobody must not panic or leak.
        broker.publish(event(1));
        assert!(broker
            .inner
            .subscribers
            .lock()
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_try_recv_empty() {
        let broker = Broker::new();
        let mut stream = broker.subscribe();
        assert_eq!(stream.try_recv(), None);

        broker.publish(event(7));
        assert_eq!(stream.try_recv(), Some(event(7)));
    }
}
