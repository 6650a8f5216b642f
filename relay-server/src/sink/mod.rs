//! Delivery sinks: where relayed payloads end up.
//!
//! The relay only depends on the [`DeliverySink`] trait. Production uses
//! [`WebSocketSink`]; tests script failures with an in-memory sink.

pub mod websocket;

use std::time::Duration;

use async_trait::async_trait;

use crate::relay::Envelope;

pub use websocket::WebSocketSink;

/// Why a single delivery attempt failed.
///
/// The processor treats every variant the same way: the payload is retried.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),

    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Downstream consumer of relayed payloads.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// Deliver one envelope, or report why it could not be delivered.
    async fn deliver(&self, envelope: &Envelope) -> Result<(), DeliveryError>;

    /// Cheap reachability check used by status reporting.
    async fn probe(&self) -> bool;
}
