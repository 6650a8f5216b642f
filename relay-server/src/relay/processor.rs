//! The single relay consumer loop.
//!
//! Pops one envelope at a time, hands it to the [`DeliverySink`] and on
//! failure puts it back at the head of the queue before pausing, so the
//! backlog behind it is never reordered.
//!
//! ```text
//!            pop ok                      deliver ok
//!   Idle ───────────────► Delivering ─────────────────► Idle
//!    ▲                        │ deliver err
//!    │                        ▼
//!    └──── retry_delay ◄── requeue_front (or dead-letter at max_attempts)
//! ```

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::dead_letter::DeadLetterStore;
use super::envelope::Envelope;
use super::queue::RelayQueue;
use crate::sink::{DeliveryError, DeliverySink};

/// Timing and retry policy for the consumer loop.
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    /// How long one pop waits before the loop re-checks for cancellation
    pub pop_timeout: Duration,
    /// Pause after a failed delivery (or a caught panic)
    pub retry_delay: Duration,
    /// Bound on a single `deliver` call
    pub delivery_timeout: Duration,
    /// Attempts before dead-lettering; `None` retries forever
    pub max_attempts: Option<u32>,
    /// How long a restart waits for this loop to stop
    pub shutdown_grace: Duration,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            pop_timeout: Duration::from_secs(1),
            retry_delay: Duration::from_secs(5),
            delivery_timeout: Duration::from_secs(10),
            max_attempts: None,
            shutdown_grace: Duration::from_secs(11),
        }
    }
}

/// Result of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Idle,
    Delivered,
    Retrying,
    DeadLettered,
    Stopped,
}

pub struct RelayProcessor {
    queue: Arc<RelayQueue>,
    sink: Arc<dyn DeliverySink>,
    dead_letters: Arc<DeadLetterStore>,
    settings: ProcessorSettings,
}

impl RelayProcessor {
    pub fn new(
        queue: Arc<RelayQueue>,
        sink: Arc<dyn DeliverySink>,
        dead_letters: Arc<DeadLetterStore>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            queue,
            sink,
            dead_letters,
            settings,
        }
    }

    /// Run until `cancel` fires.
    ///
    /// `running` is held true for the lifetime of the loop and cleared when it
    /// exits for any reason, including the task being aborted.
    pub async fn run(self, cancel: CancellationToken, running: Arc<AtomicBool>) {
        let _running = RunningFlag::raise(running);

        info!(
            backlog = self.queue.size(),
            max_attempts = ?self.settings.max_attempts,
            retry_delay_ms = self.settings.retry_delay.as_millis() as u64,
            "relay_processor_started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match AssertUnwindSafe(self.step(&cancel)).catch_unwind().await {
                Ok(Step::Stopped) => break,
                Ok(_) => {}
                Err(panic) => {
                    error!(
                        panic = %panic_message(panic.as_ref()),
                        backlog = self.queue.size(),
                        "relay_processor_crashed"
                    );
                    if self.pause(&cancel).await {
                        break;
                    }
                }
            }
        }

        info!(backlog = self.queue.size(), "relay_processor_stopped");
    }

    async fn step(&self, cancel: &CancellationToken) -> Step {
        let popped = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Step::Stopped,
            popped = self.queue.pop(self.settings.pop_timeout) => popped,
        };

        let Some(mut envelope) = popped else {
            return Step::Idle;
        };
        envelope.attempts += 1;

        let summary = envelope.summary();
        info!(
            sender = %summary.sender,
            preview = %summary.preview,
            attempt = envelope.attempts,
            backlog = self.queue.size(),
            "relay_delivery_started"
        );

        let in_flight = InFlight::new(&self.queue, envelope);
        let result = self.deliver(in_flight.envelope()).await;
        let envelope = in_flight.release();

        match result {
            Ok(()) => {
                info!(
                    sender = %summary.sender,
                    attempt = envelope.attempts,
                    backlog = self.queue.size(),
                    "relay_delivery_completed"
                );
                Step::Delivered
            }
            Err(e) => {
                if let Some(max) = self.settings.max_attempts {
                    if envelope.attempts >= max {
                        error!(
                            sender = %summary.sender,
                            attempt = envelope.attempts,
                            max_attempts = max,
                            error = %e,
                            "relay_dead_lettered"
                        );
                        self.dead_letters.push(envelope, e.to_string());
                        return Step::DeadLettered;
                    }
                }

                warn!(
                    sender = %summary.sender,
                    attempt = envelope.attempts,
                    error = %e,
                    retry_in_ms = self.settings.retry_delay.as_millis() as u64,
                    "relay_delivery_failed"
                );
                self.queue.requeue_front(envelope);

                if self.pause(cancel).await {
                    Step::Stopped
                } else {
                    Step::Retrying
                }
            }
        }
    }

    async fn deliver(&self, envelope: &Envelope) -> Result<(), DeliveryError> {
        match timeout(self.settings.delivery_timeout, self.sink.deliver(envelope)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(self.settings.delivery_timeout)),
        }
    }

    /// Sleep for `retry_delay`; returns true if cancelled meanwhile.
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = sleep(self.settings.retry_delay) => false,
        }
    }
}

/// Holds the envelope being delivered.
///
/// If dropped without [`InFlight::release`] (a panic unwinding through the
/// delivery, or the task being aborted) the envelope goes back to the head of
/// the queue.
struct InFlight<'a> {
    queue: &'a RelayQueue,
    envelope: Envelope,
    armed: bool,
}

impl<'a> InFlight<'a> {
    fn new(queue: &'a RelayQueue, envelope: Envelope) -> Self {
        Self {
            queue,
            envelope,
            armed: true,
        }
    }

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Hand the envelope back to the caller; dropping no longer requeues it.
    fn release(mut self) -> Envelope {
        self.armed = false;
        std::mem::take(&mut self.envelope)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            let envelope = std::mem::take(&mut self.envelope);
            let summary = envelope.summary();
            warn!(
                sender = %summary.sender,
                attempt = envelope.attempts,
                "relay_in_flight_restored"
            );
            self.queue.requeue_front(envelope);
        }
    }
}

/// Sets the shared liveness flag on creation and clears it on drop.
struct RunningFlag(Arc<AtomicBool>);

impl RunningFlag {
    fn raise(flag: Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for RunningFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use tokio::task::JoinHandle;

    use super::*;
    use crate::relay::test_support::{envelope, fast_settings, wait_until};
    use crate::sink::testing::{Attempt, ScriptedSink};

    struct Harness {
        queue: Arc<RelayQueue>,
        sink: Arc<ScriptedSink>,
        dead_letters: Arc<DeadLetterStore>,
        cancel: CancellationToken,
        running: Arc<AtomicBool>,
        task: JoinHandle<()>,
    }

    fn start(sink: ScriptedSink, settings: ProcessorSettings, preload: &[&str]) -> Harness {
        let queue = Arc::new(RelayQueue::new());
        for id in preload {
            queue.push(envelope(id));
        }
        let sink = Arc::new(sink);
        let dead_letters = Arc::new(DeadLetterStore::new(16));
        let cancel = CancellationToken::new();
        let running = Arc::new(AtomicBool::new(false));

        let processor = RelayProcessor::new(
            Arc::clone(&queue),
            sink.clone(),
            Arc::clone(&dead_letters),
            settings,
        );
        let task = tokio::spawn(processor.run(cancel.clone(), Arc::clone(&running)));

        Harness {
            queue,
            sink,
            dead_letters,
            cancel,
            running,
            task,
        }
    }

    fn attempt(id: &str, attempts: u32, ok: bool) -> Attempt {
        Attempt {
            id: id.to_string(),
            attempts,
            ok,
        }
    }

    #[tokio::test]
    async fn test_delivers_in_push_order_exactly_once() {
        let ids: Vec<String> = (0..25).map(|i| format!("msg-{i}")).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let h = start(ScriptedSink::new(), fast_settings(), &refs);

        assert!(wait_until(|| h.sink.delivered().len() == 25).await);
        assert_eq!(h.sink.delivered(), ids);
        assert!(h.sink.attempts().iter().all(|a| a.attempts == 1));
        assert_eq!(h.queue.size(), 0);
    }

    #[tokio::test]
    async fn test_failing_head_blocks_backlog_until_it_succeeds() {
        let sink = ScriptedSink::new();
        sink.fail_times("A", 2);
        let h = start(sink, fast_settings(), &["A", "B", "C"]);

        assert!(wait_until(|| h.sink.delivered().len() == 3).await);
        assert_eq!(
            h.sink.attempts(),
            vec![
                attempt("A", 1, false),
                attempt("A", 2, false),
                attempt("A", 3, true),
                attempt("B", 1, true),
                attempt("C", 1, true),
            ]
        );
    }

    #[tokio::test]
    async fn test_payloads_pushed_during_retry_stay_behind_head() {
        let sink = ScriptedSink::new();
        sink.fail_times("P", 3);
        let h = start(sink, fast_settings(), &["P", "Q1", "Q2"]);

        assert!(wait_until(|| !h.sink.attempts().is_empty()).await);
        h.queue.push(envelope("Q3"));
        h.queue.push(envelope("Q4"));

        assert!(wait_until(|| h.sink.delivered().len() == 5).await);
        assert_eq!(h.sink.delivered(), vec!["P", "Q1", "Q2", "Q3", "Q4"]);

        let p_calls = h.sink.attempts().iter().filter(|a| a.id == "P").count();
        assert_eq!(p_calls, 4);
    }

    #[tokio::test]
    async fn test_attempt_ceiling_dead_letters_and_unblocks_backlog() {
        let sink = ScriptedSink::new();
        sink.fail_times("A", 100);
        let settings = ProcessorSettings {
            max_attempts: Some(3),
            ..fast_settings()
        };
        let h = start(sink, settings, &["A", "B", "C"]);

        assert!(wait_until(|| h.sink.delivered().len() == 2).await);
        assert_eq!(h.sink.delivered(), vec!["B", "C"]);

        let letters = h.dead_letters.list(10);
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].envelope.attempts, 3);
        assert!(letters[0].error.contains("scripted refusal"));
    }

    #[tokio::test]
    async fn test_slow_sink_times_out_as_failure() {
        let settings = ProcessorSettings {
            delivery_timeout: Duration::from_millis(20),
            max_attempts: Some(2),
            ..fast_settings()
        };
        let h = start(
            ScriptedSink::with_delay(Duration::from_millis(500)),
            settings,
            &["slow"],
        );

        assert!(wait_until(|| h.dead_letters.len() == 1).await);
        let letter = &h.dead_letters.list(1)[0];
        assert_eq!(letter.envelope.attempts, 2);
        assert!(letter.error.contains("timed out"));
    }

    #[tokio::test]
    async fn test_sink_panic_keeps_payload_and_loop() {
        let sink = ScriptedSink::new();
        sink.panic_times("A", 1);
        let h = start(sink, fast_settings(), &["A", "B"]);

        assert!(wait_until(|| h.sink.delivered().len() == 2).await);
        assert_eq!(h.sink.delivered(), vec!["A", "B"]);
        assert_eq!(h.sink.attempts()[0], attempt("A", 2, true));
        assert!(h.running.load(Ordering::SeqCst));
        assert!(!h.task.is_finished());
    }

    #[tokio::test]
    async fn test_cancel_stops_loop_and_clears_running() {
        let h = start(ScriptedSink::new(), fast_settings(), &[]);
        assert!(wait_until(|| h.running.load(Ordering::SeqCst)).await);

        h.cancel.cancel();
        h.task.await.unwrap();
        assert!(!h.running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_keeps_failed_payload_queued() {
        let sink = ScriptedSink::new();
        sink.set_always_fail(true);
        let settings = ProcessorSettings {
            retry_delay: Duration::from_secs(30),
            ..fast_settings()
        };
        let h = start(sink, settings, &["A", "B"]);

        assert!(wait_until(|| h.sink.attempts().len() == 1).await);
        h.cancel.cancel();
        h.task.await.unwrap();

        assert_eq!(h.queue.size(), 2);
        let head = h.queue.pop(Duration::from_millis(10)).await.unwrap();
        assert_eq!(head.summary().sender, "A");
        assert_eq!(head.attempts, 1);
    }

    #[tokio::test]
    async fn test_abort_mid_delivery_restores_envelope() {
        let h = start(
            ScriptedSink::with_delay(Duration::from_secs(30)),
            fast_settings(),
            &["A", "B"],
        );

        assert!(wait_until(|| h.queue.size() == 1).await);
        h.task.abort();
        let _ = h.task.await;

        assert!(!h.running.load(Ordering::SeqCst));
        assert_eq!(h.queue.size(), 2);
        let head = h.queue.pop(Duration::from_millis(10)).await.unwrap();
        assert_eq!(head.summary().sender, "A");
    }

    #[tokio::test]
    async fn test_in_flight_release_and_drop() {
        let queue = RelayQueue::new();
        queue.push(envelope("next"));

        let mut held = envelope("held");
        held.attempts = 3;
        let in_flight = InFlight::new(&queue, held);
        assert_eq!(in_flight.envelope().summary().sender, "held");
        let released = in_flight.release();
        assert_eq!(released.attempts, 3);
        assert_eq!(queue.size(), 1);

        drop(InFlight::new(&queue, released));
        assert_eq!(queue.size(), 2);
        let head = queue.pop(Duration::from_millis(10)).await.unwrap();
        assert_eq!(head.summary().sender, "held");
        assert_eq!(head.attempts, 3);
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }
}
