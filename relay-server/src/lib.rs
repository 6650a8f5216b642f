//! Webhook relay server.
//!
//! Receives chat-platform webhooks over HTTP and relays each one, in arrival
//! order and at least once, to a downstream WebSocket consumer.
//!
//! ## Architecture
//!
//! ```text
//! Platform → POST /webhook → Relay (FIFO) → RelayProcessor → WebSocket consumer
//!                                ▲
//!                    ProcessorSupervisor keeps one consumer alive
//! ```
//!
//! Operators also get a contact cache used to enrich webhooks and a thin
//! outbound client for sending messages.

pub mod config;
pub mod contacts;
pub mod outbound;
pub mod relay;
pub mod sink;
pub mod web;

// Re-export commonly used types
pub use config::Config;
pub use contacts::{Contact, ContactCache, ContactError};
pub use outbound::{GraphClient, SendError};
pub use relay::{Envelope, Payload, ProcessorSettings, Relay, RelayError};
pub use sink::{DeliveryError, DeliverySink, WebSocketSink};
pub use web::{router, AppState};
