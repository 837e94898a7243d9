//! FIFO queue of lock waiters.
//!
//! Waiters are identified by their owning thread: a thread re-entering
//! the acquisition path after a hook callback finds its earlier
//! semaphore instead of enqueuing a second one.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::semaphore::Semaphore;

/// Arrival-ordered queue of [`Semaphore`] references.
///
/// Removal from arbitrary positions is O(n); lock queues are short.
#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    waiters: VecDeque<Arc<Semaphore>>,
}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends a waiter at the tail.
    pub(crate) fn enqueue(&mut self, semaphore: Arc<Semaphore>) {
        self.waiters.push_back(semaphore);
    }

    /// Returns the head without removing it.
    pub(crate) fn peek(&self) -> Option<&Arc<Semaphore>> {
        self.waiters.front()
    }

    /// Removes and returns the head.
    pub(crate) fn dequeue(&mut self) -> Option<Arc<Semaphore>> {
        self.waiters.pop_front()
    }

    /// Removes the waiter belonging to the same thread as `semaphore`,
    /// wherever it sits in the queue. Used on timeout and when a hook
    /// grants the lock before the wait begins.
    pub(crate) fn remove(&mut self, semaphore: &Semaphore) {
        let id = semaphore.waiter_id();
        self.waiters.retain(|queued| queued.waiter_id() != id);
    }

    /// Returns the queued semaphore owned by the same thread as
    /// `semaphore`, if one exists.
    pub(crate) fn get(&self, semaphore: &Semaphore) -> Option<Arc<Semaphore>> {
        let id = semaphore.waiter_id();
        self.waiters
            .iter()
            .find(|queued| queued.waiter_id() == id)
            .cloned()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }
}
