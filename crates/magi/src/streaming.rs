//! Bounded streaming event queue with drop-oldest and backpressure policies.
//!
//! Critical events (terminal phases, final results, terminal errors) are
//! never silently dropped: under pressure the emitter evicts the oldest
//! normal-priority entry to make room, and if the queue holds only critical
//! entries it applies backpressure regardless of policy.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::OverflowPolicy;
use crate::error::{MagiError, Result};
use crate::events::{Event, EventPriority};

pub type SendFn =
    Arc<dyn Fn(Event) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct StreamingMetrics {
    pub emitted: u64,
    pub dropped: u64,
    pub ttfb_ms: Option<u64>,
    pub last_drop_reason: Option<String>,
}

struct QueuedEvent {
    event: Event,
    priority: EventPriority,
}

struct EmitterState {
    queue: VecDeque<QueuedEvent>,
    closed: bool,
    metrics: StreamingMetrics,
    started_at: Option<Instant>,
}

struct Shared {
    state: Mutex<EmitterState>,
    capacity: usize,
    emit_timeout: Duration,
    policy: OverflowPolicy,
    /// Wakes the drain worker when events arrive or the emitter closes.
    pending: Notify,
    /// Wakes emitters waiting for queue space.
    space: Notify,
}

pub struct StreamingEmitter {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    send_fn: SendFn,
}

impl StreamingEmitter {
    pub fn new(
        capacity: usize,
        policy: OverflowPolicy,
        emit_timeout: Duration,
        send_fn: SendFn,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(EmitterState {
                    queue: VecDeque::with_capacity(capacity),
                    closed: false,
                    metrics: StreamingMetrics::default(),
                    started_at: None,
                }),
                capacity: capacity.max(1),
                emit_timeout,
                policy,
                pending: Notify::new(),
                space: Notify::new(),
            }),
            worker: Mutex::new(None),
            send_fn,
        }
    }

    /// Spawn the drain worker. Idempotent.
    pub async fn start(&self) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return;
        }
        {
            let mut state = self.shared.state.lock().await;
            state.started_at.get_or_insert_with(Instant::now);
        }
        let shared = Arc::clone(&self.shared);
        let send_fn = Arc::clone(&self.send_fn);
        *worker = Some(tokio::spawn(async move {
            loop {
                let next = {
                    let mut state = shared.state.lock().await;
                    match state.queue.pop_front() {
                        Some(item) => Some(item),
                        None if state.closed => break,
                        None => None,
                    }
                };

                match next {
                    Some(item) => {
                        shared.space.notify_waiters();
                        (send_fn)(item.event).await;
                        let mut state = shared.state.lock().await;
                        state.metrics.emitted += 1;
                        if state.metrics.ttfb_ms.is_none() {
                            if let Some(started) = state.started_at {
                                state.metrics.ttfb_ms =
                                    Some(started.elapsed().as_millis() as u64);
                            }
                        }
                    }
                    None => shared.pending.notified().await,
                }
            }
        }));
    }

    /// Enqueue an event under the configured overflow policy.
    pub async fn emit(&self, event: Event, priority: EventPriority) -> Result<()> {
        self.start().await;

        loop {
            {
                let mut state = self.shared.state.lock().await;
                if state.closed {
                    return Ok(());
                }
                if state.queue.len() < self.shared.capacity {
                    state.queue.push_back(QueuedEvent { event, priority });
                    self.shared.pending.notify_one();
                    return Ok(());
                }

                // Queue full. Critical always gets a slot by evicting the
                // oldest normal entry, whatever the policy.
                if priority == EventPriority::Critical {
                    if let Some(evicted) = evict_oldest_normal(&mut state.queue) {
                        record_drop(&mut state.metrics, "evicted_for_critical", &evicted);
                        state.queue.push_back(QueuedEvent { event, priority });
                        self.shared.pending.notify_one();
                        return Ok(());
                    }
                    // Only critical entries queued: fall through to wait.
                } else {
                    match self.shared.policy {
                        OverflowPolicy::Drop => {
                            if let Some(evicted) = evict_oldest_normal(&mut state.queue) {
                                record_drop(&mut state.metrics, "overflow", &evicted);
                                state.queue.push_back(QueuedEvent { event, priority });
                                self.shared.pending.notify_one();
                            } else {
                                // Queue is all critical; the new normal event
                                // is the one that yields.
                                record_drop(
                                    &mut state.metrics,
                                    "overflow_critical_only",
                                    &QueuedEvent { event, priority },
                                );
                            }
                            return Ok(());
                        }
                        OverflowPolicy::Backpressure => {}
                    }
                }
            }

            // Backpressure path: wait for space up to the emit timeout.
            let waited =
                tokio::time::timeout(self.shared.emit_timeout, self.shared.space.notified())
                    .await;
            if waited.is_err() {
                if priority == EventPriority::Critical {
                    // Keep waiting; critical delivery outranks the timeout.
                    continue;
                }
                let mut state = self.shared.state.lock().await;
                state.metrics.dropped += 1;
                state.metrics.last_drop_reason = Some("backpressure_timeout".to_string());
                warn!(reason = "backpressure_timeout", "streaming.timeout");
                return Err(MagiError::StreamingTimeout(self.shared.emit_timeout));
            }
        }
    }

    pub async fn metrics(&self) -> StreamingMetrics {
        self.shared.state.lock().await.metrics.clone()
    }

    /// Flush queued events and stop the worker.
    pub async fn close(&self) {
        {
            let mut state = self.shared.state.lock().await;
            state.closed = true;
        }
        // notify_one stores a permit when the worker is not yet parked,
        // closing the wakeup race with the drain loop.
        self.shared.pending.notify_one();
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

fn evict_oldest_normal(queue: &mut VecDeque<QueuedEvent>) -> Option<QueuedEvent> {
    let idx = queue
        .iter()
        .position(|item| item.priority == EventPriority::Normal)?;
    queue.remove(idx)
}

fn record_drop(metrics: &mut StreamingMetrics, reason: &str, dropped: &QueuedEvent) {
    metrics.dropped += 1;
    metrics.last_drop_reason = Some(reason.to_string());
    warn!(
        reason = reason,
        dropped_count = metrics.dropped,
        event = ?dropped.event,
        "streaming.drop"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConsensusPhase;
    use tokio::sync::mpsc;

    fn collector() -> (SendFn, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let send_fn: SendFn = Arc::new(move |event| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(event);
            })
        });
        (send_fn, rx)
    }

    fn progress(pct: u8) -> Event {
        Event::Progress { pct }
    }

    fn critical_phase() -> Event {
        Event::Phase {
            phase: ConsensusPhase::Resolved,
        }
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let (send_fn, mut rx) = collector();
        let emitter = StreamingEmitter::new(
            10,
            OverflowPolicy::Drop,
            Duration::from_millis(100),
            send_fn,
        );

        for pct in [10, 20, 30] {
            emitter
                .emit(progress(pct), EventPriority::Normal)
                .await
                .unwrap();
        }
        emitter.close().await;

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let Event::Progress { pct } = event {
                seen.push(pct);
            }
        }
        assert_eq!(seen, vec![10, 20, 30]);
        assert_eq!(emitter.metrics().await.emitted, 3);
    }

    /// Blocked sender: events accumulate in the queue so overflow paths can
    /// be exercised deterministically.
    fn stalled() -> (SendFn, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let gate_clone = Arc::clone(&gate);
        let send_fn: SendFn = Arc::new(move |_event| {
            let gate = Arc::clone(&gate_clone);
            Box::pin(async move {
                gate.notified().await;
            })
        });
        (send_fn, gate)
    }

    #[tokio::test]
    async fn test_drop_policy_evicts_oldest_normal() {
        let (send_fn, _gate) = stalled();
        let emitter = StreamingEmitter::new(
            2,
            OverflowPolicy::Drop,
            Duration::from_millis(50),
            send_fn,
        );

        // First event is taken by the (stalled) worker; two more fill the
        // queue; the fourth forces an eviction.
        emitter
            .emit(progress(1), EventPriority::Normal)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        for pct in [2, 3] {
            emitter
                .emit(progress(pct), EventPriority::Normal)
                .await
                .unwrap();
        }
        emitter
            .emit(progress(4), EventPriority::Normal)
            .await
            .unwrap();

        let metrics = emitter.metrics().await;
        assert_eq!(metrics.dropped, 1);
        assert_eq!(metrics.last_drop_reason.as_deref(), Some("overflow"));
    }

    #[tokio::test]
    async fn test_critical_evicts_normal_under_pressure() {
        let (send_fn, _gate) = stalled();
        let emitter = StreamingEmitter::new(
            2,
            OverflowPolicy::Drop,
            Duration::from_millis(50),
            send_fn,
        );

        emitter
            .emit(progress(1), EventPriority::Normal)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        for pct in [2, 3] {
            emitter
                .emit(progress(pct), EventPriority::Normal)
                .await
                .unwrap();
        }
        emitter
            .emit(critical_phase(), EventPriority::Critical)
            .await
            .unwrap();

        let metrics = emitter.metrics().await;
        assert_eq!(
            metrics.last_drop_reason.as_deref(),
            Some("evicted_for_critical")
        );
    }

    #[tokio::test]
    async fn test_backpressure_times_out_for_normal() {
        let (send_fn, _gate) = stalled();
        let emitter = StreamingEmitter::new(
            1,
            OverflowPolicy::Backpressure,
            Duration::from_millis(30),
            send_fn,
        );

        emitter
            .emit(progress(1), EventPriority::Normal)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        emitter
            .emit(progress(2), EventPriority::Normal)
            .await
            .unwrap();

        let result = emitter.emit(progress(3), EventPriority::Normal).await;
        assert!(matches!(result, Err(MagiError::StreamingTimeout(_))));
    }

    #[tokio::test]
    async fn test_critical_delivered_after_close() {
        let (send_fn, mut rx) = collector();
        let emitter = StreamingEmitter::new(
            10,
            OverflowPolicy::Drop,
            Duration::from_millis(100),
            send_fn,
        );

        emitter
            .emit(critical_phase(), EventPriority::Critical)
            .await
            .unwrap();
        emitter.close().await;

        let mut found = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(
                event,
                Event::Phase {
                    phase: ConsensusPhase::Resolved
                }
            ) {
                found = true;
            }
        }
        assert!(found, "critical event must be flushed on close");
    }
}
