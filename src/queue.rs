//! FIFO hand-off between the listener and the worker pool.
//!
//! Producers never block: [`RequestQueue::push`] either enqueues or hands
//! the item back when the queue is full or closed. Consumers await
//! [`RequestQueue::pop`], which parks on a [`Notify`] until an item
//! arrives or the queue is closed and drained.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

/// Multi-producer, multi-consumer FIFO queue, optionally bounded.
#[derive(Debug)]
pub struct RequestQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: Option<usize>,
    closed: AtomicBool,
    available: Notify,
}

impl<T> RequestQueue<T> {
    /// Creates an unbounded queue.
    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    /// Creates a queue holding at most `capacity` items, or an unbounded
    /// one for `None`.
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity,
            closed: AtomicBool::new(false),
            available: Notify::new(),
        }
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `item`, waking one waiting consumer.
    ///
    /// Returns the item back if the queue is closed or at capacity.
    pub fn push(&self, item: T) -> Result<(), T> {
        if self.is_closed() {
            return Err(item);
        }
        {
            let mut items = self.items();
            if self.capacity.is_some_and(|cap| items.len() >= cap) {
                return Err(item);
            }
            items.push_back(item);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Removes the oldest item, waiting for one if the queue is empty.
    ///
    /// Returns `None` once the queue is closed and fully drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.items().pop_front() {
                return Some(item);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Removes the oldest item without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.items().pop_front()
    }

    /// Rejects further pushes and wakes every waiting consumer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

impl<T> Default for RequestQueue<T> {
    fn default() -> Self {
        Self::unbounded()
    }
}
