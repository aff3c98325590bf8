//! Bounded FIFO backing the primary (structured) transport mode.
//!
//! Multi-producer / single-consumer. Pushes never block: when the queue is
//! full the oldest element is dropped and the push retried once. The
//! consumer side waits on a notifier instead of spinning.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::events::ProgressEvent;

/// Default queue capacity.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Outcome of a single push. Explicit result, never a panic or exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Event enqueued normally.
    Queued,
    /// Queue was full; the oldest event was dropped to make room.
    DroppedOldest,
    /// Queue is closed; the event was not delivered.
    Closed,
}

struct QueueInner {
    buf: VecDeque<ProgressEvent>,
    closed: bool,
}

/// A bounded, thread-safe event FIFO.
pub struct EventQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl EventQueue {
    /// Create a queue with the given capacity.
    pub fn bounded(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(QueueInner {
                buf: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        })
    }

    /// Push an event. On a full queue the oldest element is dropped and the
    /// push retried once.
    pub fn push(&self, event: ProgressEvent) -> PushOutcome {
        let outcome = {
            let mut inner = self.inner.lock().expect("event queue poisoned");
            if inner.closed {
                return PushOutcome::Closed;
            }
            if inner.buf.len() >= self.capacity {
                inner.buf.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                inner.buf.push_back(event);
                PushOutcome::DroppedOldest
            } else {
                inner.buf.push_back(event);
                PushOutcome::Queued
            }
        };
        if outcome == PushOutcome::DroppedOldest {
            tracing::warn!(capacity = self.capacity, "event queue full, dropped oldest");
        }
        self.notify.notify_one();
        outcome
    }

    /// Wait for the next event. Returns `None` once the queue is closed and
    /// drained.
    pub async fn pop(&self) -> Option<ProgressEvent> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().expect("event queue poisoned");
                if let Some(ev) = inner.buf.pop_front() {
                    return Some(ev);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Pop without waiting.
    pub fn try_pop(&self) -> Option<ProgressEvent> {
        self.inner
            .lock()
            .expect("event queue poisoned")
            .buf
            .pop_front()
    }

    /// Close the queue. Buffered events remain poppable; further pushes
    /// return [`PushOutcome::Closed`].
    pub fn close(&self) {
        self.inner.lock().expect("event queue poisoned").closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("event queue poisoned").closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("event queue poisoned").buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total events dropped due to overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ProgressEvent;

    fn ev(step: &str) -> ProgressEvent {
        ProgressEvent::phase_start(step, 10, "test")
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let q = EventQueue::bounded(8);
        q.push(ev("a"));
        q.push(ev("b"));
        q.push(ev("c"));
        assert_eq!(q.pop().await.unwrap().phase, "a");
        assert_eq!(q.pop().await.unwrap().phase, "b");
        assert_eq!(q.pop().await.unwrap().phase, "c");
    }

    #[tokio::test]
    async fn test_full_drops_oldest() {
        let q = EventQueue::bounded(2);
        assert_eq!(q.push(ev("a")), PushOutcome::Queued);
        assert_eq!(q.push(ev("b")), PushOutcome::Queued);
        assert_eq!(q.push(ev("c")), PushOutcome::DroppedOldest);
        assert_eq!(q.dropped(), 1);
        // Oldest ("a") was sacrificed
        assert_eq!(q.pop().await.unwrap().phase, "b");
        assert_eq!(q.pop().await.unwrap().phase, "c");
    }

    #[tokio::test]
    async fn test_closed_rejects_push_but_drains() {
        let q = EventQueue::bounded(4);
        q.push(ev("a"));
        q.close();
        assert_eq!(q.push(ev("b")), PushOutcome::Closed);
        assert_eq!(q.pop().await.unwrap().phase, "a");
        assert!(q.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let q = EventQueue::bounded(4);
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.pop().await });
        tokio::task::yield_now().await;
        q.push(ev("late"));
        let got = handle.await.unwrap().unwrap();
        assert_eq!(got.phase, "late");
    }

    #[tokio::test]
    async fn test_pop_wakes_on_close() {
        let q = EventQueue::bounded(4);
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.pop().await });
        tokio::task::yield_now().await;
        q.close();
        assert!(handle.await.unwrap().is_none());
    }
}
