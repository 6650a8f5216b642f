//! In-process ordered relay.
//!
//! This module provides:
//! - [`RelayQueue`]: unbounded FIFO with push-to-front for retries
//! - [`RelayProcessor`]: the single consumer loop
//! - [`ProcessorSupervisor`]: keeps exactly one consumer alive
//! - [`Relay`]: the facade handed to request handlers
//!
//! ## Architecture
//!
//! ```text
//! submit → RelayQueue → RelayProcessor → DeliverySink
//!              ▲               │ failure
//!              └─ requeue_front┘
//! ```
//!
//! Delivery is at-least-once and strictly ordered: a failing head payload is
//! retried in place and everything behind it waits.

pub mod dead_letter;
pub mod envelope;
pub mod facade;
pub mod processor;
pub mod queue;
pub mod supervisor;

pub use dead_letter::{DeadLetter, DeadLetterStore};
pub use envelope::{webhook_sender, Envelope, Payload, PayloadSummary};
pub use facade::{ClearReport, QueueLengths, Relay, RelayStatus, RetryReport, SubmitReceipt};
pub use processor::{ProcessorSettings, RelayProcessor};
pub use queue::RelayQueue;
pub use supervisor::{ConsumerState, ProcessorHandle, ProcessorSupervisor, RestartReport, Supervision};

/// Errors raised while setting up the relay.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The consumer needs a Tokio runtime to run on.
    #[error("no async runtime available to host the relay consumer")]
    NoRuntime,
}
