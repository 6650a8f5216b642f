//! Bounded holding area for payloads that exhausted their delivery attempts.
//!
//! Only populated when an attempt ceiling is configured; with the default
//! unlimited retry the store stays empty. A bounded store drops its oldest
//! letter when full, logging `dead_letter_evicted` with the payload summary.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use super::envelope::Envelope;

/// A payload removed from the main queue after its final failed attempt.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub envelope: Envelope,
    /// Error from the last attempt
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct DeadLetterStore {
    /// None keeps every letter
    capacity: Option<usize>,
    letters: Mutex<VecDeque<DeadLetter>>,
}

impl DeadLetterStore {
    /// A store holding at most `capacity` letters; 0 means unbounded.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: (capacity > 0).then_some(capacity),
            letters: Mutex::new(VecDeque::new()),
        }
    }

    /// Record a dead letter, evicting the oldest one when full.
    pub fn push(&self, envelope: Envelope, error: String) {
        let mut letters = self.lock();
        if let Some(capacity) = self.capacity {
            while letters.len() >= capacity {
                let Some(evicted) = letters.pop_front() else {
                    break;
                };
                let summary = evicted.envelope.summary();
                warn!(
                    sender = %summary.sender,
                    preview = %summary.preview,
                    attempts = evicted.envelope.attempts,
                    error = %evicted.error,
                    capacity = capacity,
                    "dead_letter_evicted"
                );
            }
        }
        letters.push_back(DeadLetter {
            envelope,
            error,
            failed_at: Utc::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of up to `limit` dead letters, oldest first.
    pub fn list(&self, limit: usize) -> Vec<DeadLetter> {
        self.lock().iter().take(limit).cloned().collect()
    }

    /// Remove and return up to `limit` dead letters, oldest first.
    pub fn take(&self, limit: usize) -> Vec<DeadLetter> {
        let mut letters = self.lock();
        let count = limit.min(letters.len());
        letters.drain(..count).collect()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<DeadLetter>> {
        self.letters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn envelope(id: &str) -> Envelope {
        Envelope::new(json!({ "from": id }).as_object().cloned().unwrap())
    }

    fn senders(letters: &[DeadLetter]) -> Vec<String> {
        letters.iter().map(|l| l.envelope.summary().sender).collect()
    }

    #[test]
    fn test_take_is_oldest_first() {
        let store = DeadLetterStore::new(10);
        for id in ["a", "b", "c"] {
            store.push(envelope(id), "connection refused".to_string());
        }

        assert_eq!(senders(&store.take(2)), vec!["a", "b"]);
        assert_eq!(store.len(), 1);
        assert_eq!(senders(&store.list(10)), vec!["c"]);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let store = DeadLetterStore::new(2);
        for id in ["a", "b", "c"] {
            store.push(envelope(id), "timeout".to_string());
        }
        assert_eq!(senders(&store.list(10)), vec!["b", "c"]);
    }

    #[test]
    fn test_zero_capacity_is_unbounded() {
        let store = DeadLetterStore::new(0);
        for i in 0..2_000 {
            store.push(envelope(&i.to_string()), "timeout".to_string());
        }
        assert_eq!(store.len(), 2_000);
        assert_eq!(senders(&store.list(1)), vec!["0"]);
    }

    #[test]
    fn test_take_more_than_available() {
        let store = DeadLetterStore::new(5);
        store.push(envelope("only"), "boom".to_string());
        assert_eq!(store.take(10).len(), 1);
        assert!(store.is_empty());
    }
}
