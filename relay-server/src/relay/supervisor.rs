//! Keeps exactly one relay consumer alive.
//!
//! The current consumer lives in a single slot guarded by an async mutex.
//! [`ProcessorSupervisor::ensure_running`] only ever *tries* the lock: if
//! someone else holds it they are already starting or restarting the
//! consumer, so the caller returns immediately instead of waiting.
//! [`ProcessorSupervisor::restart`] holds the lock across the whole
//! stop-join-start sequence, which is what rules out two consumers racing on
//! the queue.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::dead_letter::DeadLetterStore;
use super::processor::{ProcessorSettings, RelayProcessor};
use super::queue::RelayQueue;
use super::RelayError;
use crate::sink::DeliverySink;

/// The running consumer task and what is needed to stop it.
#[derive(Debug)]
pub struct ProcessorHandle {
    generation: u64,
    name: String,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ProcessorHandle {
    /// The loop's own flag: true until it exits or unwinds.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Flag set and the task still scheduled.
    ///
    /// Checking both catches a task that ended without clearing its flag as
    /// well as a flag cleared while the task is winding down.
    pub fn is_alive(&self) -> bool {
        self.is_running() && !self.task.is_finished()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Outcome of an [`ProcessorSupervisor::ensure_running`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Supervision {
    /// A healthy consumer was already running; nothing changed.
    AlreadyRunning,
    /// No healthy consumer existed; a new one was started.
    Started,
    /// Another caller is starting or restarting the consumer right now.
    Busy,
}

/// Result of an operator-requested restart.
#[derive(Debug, Clone, Serialize)]
pub struct RestartReport {
    pub ok: bool,
    pub message: String,
}

/// Snapshot of the consumer slot for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerState {
    pub running: bool,
    pub alive: bool,
    pub name: Option<String>,
    pub generation: u64,
    pub started_at: Option<DateTime<Utc>>,
}

pub struct ProcessorSupervisor {
    queue: Arc<RelayQueue>,
    sink: Arc<dyn DeliverySink>,
    dead_letters: Arc<DeadLetterStore>,
    settings: ProcessorSettings,
    runtime: Handle,
    slot: Mutex<Option<ProcessorHandle>>,
    generation: AtomicU64,
}

impl ProcessorSupervisor {
    /// Create a supervisor bound to the current Tokio runtime.
    ///
    /// Fails with [`RelayError::NoRuntime`] outside a runtime, since there
    /// would be nowhere to host the consumer. No consumer is started yet.
    pub fn new(
        queue: Arc<RelayQueue>,
        sink: Arc<dyn DeliverySink>,
        dead_letters: Arc<DeadLetterStore>,
        settings: ProcessorSettings,
    ) -> Result<Self, RelayError> {
        let runtime = Handle::try_current().map_err(|_| RelayError::NoRuntime)?;

        Ok(Self {
            queue,
            sink,
            dead_letters,
            settings,
            runtime,
            slot: Mutex::new(None),
            generation: AtomicU64::new(0),
        })
    }

    /// Start a consumer unless a healthy one already exists.
    ///
    /// Cheap and non-blocking; safe to call on every enqueue.
    pub fn ensure_running(&self) -> Supervision {
        let Ok(mut slot) = self.slot.try_lock() else {
            return Supervision::Busy;
        };

        if slot.as_ref().is_some_and(ProcessorHandle::is_alive) {
            return Supervision::AlreadyRunning;
        }

        if let Some(stale) = slot.take() {
            warn!(
                consumer = %stale.name,
                running = stale.is_running(),
                finished = stale.task.is_finished(),
                "supervisor_stale_consumer"
            );
            stale.cancel.cancel();
            stale.task.abort();
        }

        *slot = Some(self.spawn());
        Supervision::Started
    }

    /// Stop the current consumer (if any) and start a fresh one.
    pub async fn restart(&self) -> RestartReport {
        info!("supervisor_restart_requested");
        let mut slot = self.slot.lock().await;

        if let Some(old) = slot.take() {
            self.stop(old).await;
        }

        let handle = self.spawn();
        // Let the new task get scheduled before judging it.
        tokio::task::yield_now().await;
        let ok = handle.is_alive();
        let name = handle.name.clone();
        *slot = Some(handle);

        if ok {
            info!(consumer = %name, "supervisor_restart_complete");
            RestartReport {
                ok: true,
                message: format!("processor restarted as {name}"),
            }
        } else {
            error!(consumer = %name, "supervisor_restart_failed");
            RestartReport {
                ok: false,
                message: "processor could not be restarted".to_string(),
            }
        }
    }

    /// Stop the consumer without starting a replacement.
    pub async fn shutdown(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(handle) = slot.take() {
            self.stop(handle).await;
        }
    }

    pub async fn state(&self) -> ConsumerState {
        let slot = self.slot.lock().await;
        let generation = self.generation.load(Ordering::SeqCst);

        match slot.as_ref() {
            Some(handle) => ConsumerState {
                running: handle.is_running(),
                alive: handle.is_alive(),
                name: Some(handle.name.clone()),
                generation,
                started_at: Some(handle.started_at),
            },
            None => ConsumerState {
                running: false,
                alive: false,
                name: None,
                generation,
                started_at: None,
            },
        }
    }

    fn spawn(&self) -> ProcessorHandle {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let name = format!("relay-processor-{generation}");
        let cancel = CancellationToken::new();
        let running = Arc::new(AtomicBool::new(true));

        let processor = RelayProcessor::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.sink),
            Arc::clone(&self.dead_letters),
            self.settings.clone(),
        );
        let task = self
            .runtime
            .spawn(processor.run(cancel.clone(), Arc::clone(&running)));

        info!(consumer = %name, generation = generation, "supervisor_spawned");

        ProcessorHandle {
            generation,
            name,
            started_at: Utc::now(),
            cancel,
            running,
            task,
        }
    }

    /// Cancel, then join within the shutdown grace; abort if it is exceeded.
    async fn stop(&self, mut handle: ProcessorHandle) {
        handle.cancel.cancel();

        match timeout(self.settings.shutdown_grace, &mut handle.task).await {
            Ok(_) => {
                info!(consumer = %handle.name, generation = handle.generation, "supervisor_consumer_stopped");
            }
            Err(_) => {
                warn!(
                    consumer = %handle.name,
                    grace_ms = self.settings.shutdown_grace.as_millis() as u64,
                    "supervisor_consumer_aborted"
                );
                handle.task.abort();
                let _ = handle.task.await;
            }
        }
    }
}
