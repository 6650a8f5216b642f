//! Unbounded in-memory FIFO feeding the single relay consumer.
//!
//! A `VecDeque` behind a mutex gives O(1) push to either end, and a
//! [`Notify`] wakes the consumer blocked in [`RelayQueue::pop`]. The lock is
//! only ever held for a single deque operation and never across an await.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

use super::envelope::Envelope;

#[derive(Debug, Default)]
pub struct RelayQueue {
    items: Mutex<VecDeque<Envelope>>,
    available: Notify,
}

impl RelayQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the tail. Never blocks on I/O and never fails.
    pub fn push(&self, envelope: Envelope) {
        self.lock().push_back(envelope);
        self.available.notify_one();
    }

    /// Make `envelope` the new head, ahead of everything currently queued.
    ///
    /// A push racing with this call lands behind the requeued envelope
    /// because both go through the same lock.
    pub fn requeue_front(&self, envelope: Envelope) {
        self.lock().push_front(envelope);
        self.available.notify_one();
    }

    /// Remove and return the head, waiting up to `timeout` for one to arrive.
    ///
    /// Returns `None` on timeout. Cancel safe: an envelope is only removed in
    /// the same poll that returns it.
    pub async fn pop(&self, timeout: Duration) -> Option<Envelope> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before checking so a push between the check
            // and the wait is not missed.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(envelope) = self.lock().pop_front() {
                return Some(envelope);
            }

            if timeout_at(deadline, notified).await.is_err() {
                return self.lock().pop_front();
            }
        }
    }

    /// Current backlog depth.
    pub fn size(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Discard everything queued and return how many envelopes were removed.
    pub fn drain_all(&self) -> usize {
        let mut items = self.lock();
        let cleared = items.len();
        items.clear();
        cleared
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Envelope>> {
        // Every critical section is a single deque call, so a poisoned lock
        // still guards a consistent deque.
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
