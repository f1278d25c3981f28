use futures::Stream;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// Accepted after evicting the oldest entry
    DroppedOldest,
    Closed,
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded queue that evicts its oldest entry to admit a new one when full.
/// Pushing never waits.
pub struct DropOldestQueue<T> {
    inner: Mutex<Inner<T>>,
    available: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl<T> DropOldestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.min(4096)),
                closed: false,
            }),
            available: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, item: T) -> PushOutcome {
        let outcome = {
            let mut inner = self.lock();
            if inner.closed {
                return PushOutcome::Closed;
            }

            let outcome = if inner.items.len() >= self.capacity {
                inner.items.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::DroppedOldest
            } else {
                PushOutcome::Accepted
            };
            inner.items.push_back(item);
            outcome
        };

        self.available.notify_one();
        outcome
    }

    pub fn try_pop(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Wait for the next entry. Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Stop accepting entries. Buffered entries can still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total entries evicted since creation
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<T: Send + 'static> DropOldestQueue<T> {
    /// Consume the queue as a stream that ends when it is closed and drained.
    pub fn into_stream(self: Arc<Self>) -> impl Stream<Item = T> {
        futures::stream::unfold(self, |queue| async move {
            let item = queue.pop().await?;
            Some((item, queue))
        })
    }
}
