//! The relay as seen by the rest of the process.
//!
//! [`Relay`] composes the queue, the dead-letter store and the supervisor
//! behind the operator-facing operations. It is shared by `Arc` through the
//! web layer's state; [`Relay::global_or_init`] provides the one-time
//! initialisation barrier for callers that need a process-wide instance.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use super::dead_letter::{DeadLetter, DeadLetterStore};
use super::envelope::{Envelope, Payload};
use super::processor::ProcessorSettings;
use super::queue::RelayQueue;
use super::supervisor::{ProcessorSupervisor, RestartReport, Supervision};
use super::RelayError;
use crate::sink::DeliverySink;

static GLOBAL: OnceCell<Arc<Relay>> = OnceCell::const_new();

/// Acknowledgement returned to producers. Acceptance is immediate and says
/// nothing about eventual delivery.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitReceipt {
    pub accepted: bool,
    pub method: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub sink_reachable: bool,
    pub consumer_running: bool,
    pub consumer_alive: bool,
    pub consumer_name: Option<String>,
    pub consumer_generation: u64,
    pub backlog_depth: usize,
    pub dead_lettered: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueLengths {
    pub pending: usize,
    pub dead_letter: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearReport {
    pub cleared_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryReport {
    pub requeued: usize,
    pub remaining_dead_letters: usize,
}

pub struct Relay {
    queue: Arc<RelayQueue>,
    dead_letters: Arc<DeadLetterStore>,
    sink: Arc<dyn DeliverySink>,
    supervisor: ProcessorSupervisor,
}

impl Relay {
    /// Build a relay bound to the current Tokio runtime.
    ///
    /// The consumer is started lazily by the first [`Relay::submit`] or
    /// [`Relay::status`], or eagerly with [`Relay::start`].
    pub fn new(
        sink: Arc<dyn DeliverySink>,
        settings: ProcessorSettings,
        dead_letter_capacity: usize,
    ) -> Result<Self, RelayError> {
        let queue = Arc::new(RelayQueue::new());
        let dead_letters = Arc::new(DeadLetterStore::new(dead_letter_capacity));
        let supervisor = ProcessorSupervisor::new(
            Arc::clone(&queue),
            Arc::clone(&sink),
            Arc::clone(&dead_letters),
            settings,
        )?;

        Ok(Self {
            queue,
            dead_letters,
            sink,
            supervisor,
        })
    }

    /// The process-wide relay, built by `init` on first use.
    ///
    /// Concurrent first callers all receive the same instance; `init` runs
    /// at most once successfully.
    pub async fn global_or_init<F>(init: F) -> Result<Arc<Relay>, RelayError>
    where
        F: FnOnce() -> Result<Relay, RelayError>,
    {
        GLOBAL
            .get_or_try_init(|| async { init().map(Arc::new) })
            .await
            .map(Arc::clone)
    }

    pub fn start(&self) -> Supervision {
        self.supervisor.ensure_running()
    }

    /// Accept a payload for ordered delivery.
    pub fn submit(&self, payload: Payload) -> SubmitReceipt {
        if self.supervisor.ensure_running() == Supervision::Started {
            info!("relay_consumer_started_on_submit");
        }

        let envelope = Envelope::new(payload);
        let summary = envelope.summary();
        self.queue.push(envelope);

        info!(
            sender = %summary.sender,
            preview = %summary.preview,
            backlog = self.queue.size(),
            "relay_enqueued"
        );

        SubmitReceipt {
            accepted: true,
            method: "fifo_queue",
        }
    }

    pub async fn status(&self) -> RelayStatus {
        self.supervisor.ensure_running();

        let sink_reachable = self.sink.probe().await;
        let consumer = self.supervisor.state().await;

        RelayStatus {
            sink_reachable,
            consumer_running: consumer.running,
            consumer_alive: consumer.alive,
            consumer_name: consumer.name,
            consumer_generation: consumer.generation,
            backlog_depth: self.queue.size(),
            dead_lettered: self.dead_letters.len(),
        }
    }

    pub fn lengths(&self) -> QueueLengths {
        QueueLengths {
            pending: self.queue.size(),
            dead_letter: self.dead_letters.len(),
        }
    }

    pub async fn restart(&self) -> RestartReport {
        self.supervisor.restart().await
    }

    /// Drop every pending payload. Destructive; operator use only.
    pub fn clear(&self) -> ClearReport {
        let cleared_count = self.queue.drain_all();
        warn!(cleared_count = cleared_count, "relay_queue_cleared");
        ClearReport { cleared_count }
    }

    pub fn dead_letters(&self, limit: usize) -> Vec<DeadLetter> {
        self.dead_letters.list(limit)
    }

    /// Move up to `limit` dead letters back to the tail with fresh attempt counts.
    pub fn retry_dead_letters(&self, limit: usize) -> RetryReport {
        let letters = self.dead_letters.take(limit);
        let requeued = letters.len();

        for letter in letters {
            let mut envelope = letter.envelope;
            envelope.attempts = 0;
            self.queue.push(envelope);
        }

        if requeued > 0 {
            self.supervisor.ensure_running();
        }

        info!(
            requeued = requeued,
            remaining = self.dead_letters.len(),
            "relay_dead_letters_requeued"
        );

        RetryReport {
            requeued,
            remaining_dead_letters: self.dead_letters.len(),
        }
    }

    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
        info!(backlog = self.queue.size(), "relay_shutdown_complete");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::relay::test_support::{fast_settings, payload, wait_until};
    use crate::sink::testing::ScriptedSink;

    fn relay(sink: &Arc<ScriptedSink>, settings: ProcessorSettings) -> Relay {
        Relay::new(sink.clone(), settings, 16).unwrap()
    }

    #[tokio::test]
    async fn test_submit_accepts_and_delivers() {
        let sink = Arc::new(ScriptedSink::new());
        let relay = relay(&sink, fast_settings());

        let receipt = relay.submit(payload("A"));
        assert!(receipt.accepted);

        assert!(wait_until(|| sink.delivered() == vec!["A"]).await);
    }

    #[tokio::test]
    async fn test_submit_accepts_while_sink_is_down() {
        let sink = Arc::new(ScriptedSink::new());
        sink.set_always_fail(true);
        let relay = relay(&sink, fast_settings());

        for id in ["A", "B", "C"] {
            assert!(relay.submit(payload(id)).accepted);
        }
        assert!(wait_until(|| sink.attempts().len() >= 3).await);
        assert!(sink.attempts().iter().all(|a| a.id == "A"));

        sink.set_always_fail(false);
        assert!(wait_until(|| sink.delivered().len() == 3).await);
        assert_eq!(sink.delivered(), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_status_reports_consumer_and_backlog() {
        let sink = Arc::new(ScriptedSink::new());
        sink.set_always_fail(true);
        sink.set_unreachable(true);
        let settings = ProcessorSettings {
            retry_delay: Duration::from_secs(30),
            ..fast_settings()
        };
        let relay = relay(&sink, settings);

        for id in ["A", "B"] {
            relay.submit(payload(id));
        }
        assert!(wait_until(|| sink.attempts().len() == 1 && relay.lengths().pending == 2).await);

        let status = relay.status().await;
        assert!(!status.sink_reachable);
        assert!(status.consumer_running);
        assert!(status.consumer_alive);
        assert_eq!(status.consumer_generation, 1);
        assert_eq!(status.backlog_depth, 2);
        assert_eq!(status.dead_lettered, 0);
    }

    #[tokio::test]
    async fn test_status_is_idempotent_supervision() {
        let sink = Arc::new(ScriptedSink::new());
        let relay = relay(&sink, fast_settings());
        relay.start();

        let first = relay.status().await;
        let second = relay.status().await;
        assert!(first.consumer_alive && second.consumer_alive);
        assert_eq!(first.consumer_generation, second.consumer_generation);
    }

    #[tokio::test]
    async fn test_clear_reports_removed_count() {
        let sink = Arc::new(ScriptedSink::new());
        sink.set_always_fail(true);
        let settings = ProcessorSettings {
            retry_delay: Duration::from_secs(30),
            ..fast_settings()
        };
        let relay = relay(&sink, settings);

        for id in ["A", "B", "C", "D"] {
            relay.submit(payload(id));
        }
        assert!(wait_until(|| sink.attempts().len() == 1 && relay.lengths().pending == 4).await);

        // A is parked at the head waiting out its backoff, so all four are queued.
        assert_eq!(relay.clear().cleared_count, 4);
        assert_eq!(relay.status().await.backlog_depth, 0);
        assert_eq!(relay.lengths().pending, 0);
    }

    #[tokio::test]
    async fn test_retry_dead_letters_redelivers() {
        let sink = Arc::new(ScriptedSink::new());
        sink.fail_times("A", 2);
        let settings = ProcessorSettings {
            max_attempts: Some(2),
            ..fast_settings()
        };
        let relay = relay(&sink, settings);

        relay.submit(payload("A"));
        relay.submit(payload("B"));
        assert!(wait_until(|| sink.delivered() == vec!["B"]).await);
        assert_eq!(relay.lengths().dead_letter, 1);

        let report = relay.retry_dead_letters(10);
        assert_eq!(report.requeued, 1);
        assert_eq!(report.remaining_dead_letters, 0);

        assert!(wait_until(|| sink.delivered() == vec!["B", "A"]).await);
        let last = sink.attempts().last().cloned().unwrap();
        assert_eq!(last.attempts, 1);
    }

    #[tokio::test]
    async fn test_restart_keeps_queue() {
        let sink = Arc::new(ScriptedSink::new());
        let relay = relay(&sink, fast_settings());
        relay.submit(payload("A"));

        let report = relay.restart().await;
        assert!(report.ok);

        relay.submit(payload("B"));
        assert!(wait_until(|| sink.delivered() == vec!["A", "B"]).await);
        assert_eq!(relay.status().await.consumer_generation, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fifty_concurrent_submitters() {
        let sink = Arc::new(ScriptedSink::new());
        let relay = Arc::new(relay(&sink, fast_settings()));

        let mut tasks = Vec::new();
        for i in 0..50 {
            let relay = Arc::clone(&relay);
            tasks.push(tokio::spawn(async move {
                relay.submit(json!({ "from": format!("caller-{i}") }).as_object().cloned().unwrap())
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().accepted);
        }

        assert!(wait_until(|| sink.delivered().len() == 50).await);
        assert!(wait_until(|| relay.lengths().pending == 0).await);

        let mut delivered = sink.delivered();
        delivered.sort();
        delivered.dedup();
        assert_eq!(delivered.len(), 50);
        assert_eq!(sink.peak_concurrency(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_global_is_initialised_once() {
        let sink = Arc::new(ScriptedSink::new());
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let sink = Arc::clone(&sink);
            tasks.push(tokio::spawn(async move {
                Relay::global_or_init(|| Relay::new(sink, fast_settings(), 4))
                    .await
                    .unwrap()
            }));
        }

        let mut relays = Vec::new();
        for task in tasks {
            relays.push(task.await.unwrap());
        }
        assert!(relays.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }
}
