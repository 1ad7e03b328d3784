//! Bounded drop-oldest event queue feeding the state-machine loop.
//!
//! Producers never block: when the queue is full the oldest event is dropped
//! with a warning. Losing a stale vote is harmless (honest validators
//! re-gossip) and a lost timeout is recovered by the next height's ticker.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

pub struct MessageQueue<T> {
    capacity: usize,
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> MessageQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue an event, dropping the oldest one when full. Events pushed
    /// after `close` are discarded.
    pub fn push(&self, item: T) {
        {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            if inner.closed {
                return;
            }
            if inner.items.len() >= self.capacity {
                inner.items.pop_front();
                tracing::warn!(capacity = self.capacity, "consensus queue full, dropping oldest event");
            }
            inner.items.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Dequeue the next event, waiting if none is available. Returns `None`
    /// once the queue is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut inner = self.inner.lock().expect("queue lock poisoned");
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Dequeue without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.inner
            .lock()
            .expect("queue lock poisoned")
            .items
            .pop_front()
    }

    /// Close the queue; already-enqueued events are still delivered.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            inner.closed = true;
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
