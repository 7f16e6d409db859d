//! Per-session pub/sub fan-out to observers.
//!
//! Each subscriber owns a bounded queue. Publishing snapshots the subscriber
//! list under a lock; a full queue drops its oldest entry in favor of the
//! new one, favoring recency for UIs. No history is retained: late
//! subscribers only see events from subscription onward.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use magi::events::{Envelope, Event};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

pub const DEFAULT_SUBSCRIBER_QUEUE_SIZE: usize = 100;

struct SubscriberQueue {
    id: u64,
    queue: Mutex<VecDeque<Envelope>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
}

/// A handle for one observer; dropped or explicitly unsubscribed when the
/// connection ends.
pub struct Subscription {
    session_id: String,
    inner: Arc<SubscriberQueue>,
}

impl Subscription {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub(crate) fn subscriber_id(&self) -> u64 {
        self.inner.id
    }

    /// Receive the next event; `None` once the session's stream is closed
    /// and the queue is drained.
    pub async fn recv(&self) -> Option<Envelope> {
        loop {
            {
                let mut queue = self.inner.queue.lock().await;
                if let Some(envelope) = queue.pop_front() {
                    return Some(envelope);
                }
                if self.inner.closed.load(Ordering::SeqCst) {
                    return None;
                }
            }
            self.inner.notify.notified().await;
        }
    }
}

pub struct EventBroadcaster {
    subscribers: Mutex<HashMap<String, Vec<Arc<SubscriberQueue>>>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl EventBroadcaster {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity,
        }
    }

    pub async fn subscribe(&self, session_id: &str) -> Subscription {
        let inner = Arc::new(SubscriberQueue {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            capacity: self.queue_capacity,
        });
        let mut subscribers = self.subscribers.lock().await;
        subscribers
            .entry(session_id.to_string())
            .or_default()
            .push(Arc::clone(&inner));
        debug!(session_id, subscriber = inner.id, "broadcaster.subscribe");
        Subscription {
            session_id: session_id.to_string(),
            inner,
        }
    }

    pub async fn unsubscribe(&self, subscription: &Subscription) {
        let mut subscribers = self.subscribers.lock().await;
        if let Some(list) = subscribers.get_mut(subscription.session_id()) {
            list.retain(|q| q.id != subscription.subscriber_id());
            if list.is_empty() {
                subscribers.remove(subscription.session_id());
            }
        }
    }

    /// Stamp the envelope fields and fan the event out to every subscriber
    /// of the session.
    pub async fn publish(&self, session_id: &str, event: Event) {
        let envelope = Envelope::new(session_id, event);
        let targets: Vec<Arc<SubscriberQueue>> = {
            let subscribers = self.subscribers.lock().await;
            subscribers
                .get(session_id)
                .map(|list| list.to_vec())
                .unwrap_or_default()
        };

        for target in targets {
            let mut queue = target.queue.lock().await;
            if queue.len() >= target.capacity {
                queue.pop_front();
                debug!(session_id, subscriber = target.id, "broadcaster.drop_oldest");
            }
            queue.push_back(envelope.clone());
            drop(queue);
            target.notify.notify_one();
        }
    }

    /// Mark a session's stream finished: subscribers drain what is queued
    /// and then receive `None`.
    pub async fn close_session(&self, session_id: &str) {
        let mut subscribers = self.subscribers.lock().await;
        if let Some(list) = subscribers.remove(session_id) {
            for queue in list {
                queue.closed.store(true, Ordering::SeqCst);
                queue.notify.notify_one();
            }
        }
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_QUEUE_SIZE)
    }
}
