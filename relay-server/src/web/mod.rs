//! HTTP surface.
//!
//! - `/webhook`: platform handshake and inbound webhooks, relayed in order
//! - `/api/queue/*`: operator view and control of the relay
//! - `/api/numbers/*`: contact cache used to enrich webhooks
//! - `/api/messages/*`: outbound sends through the Graph API

pub mod contacts;
pub mod error;
pub mod handlers;
pub mod messages;
pub mod queue;
pub mod signature;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use error::ApiError;
pub use handlers::{health, receive_webhook, service_status, verify_webhook, AppState, HealthResponse};
pub use signature::{is_signature_verification_enabled, verify_hub_signature};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook", get(verify_webhook).post(receive_webhook))
        .route("/api/health", get(health))
        .route("/api/status", get(service_status))
        .route("/api/queue/status", get(queue::status))
        .route("/api/queue/lengths", get(queue::lengths))
        .route("/api/queue/restart", post(queue::restart))
        .route("/api/queue/clear", delete(queue::clear))
        .route("/api/queue/test", post(queue::test_message))
        .route("/api/queue/retry_failed", post(queue::retry_failed))
        .route("/api/queue/dead_letters", get(queue::dead_letters))
        .route("/api/numbers", get(contacts::list).post(contacts::add))
        .route("/api/numbers/clear", post(contacts::clear))
        .route("/api/numbers/:phone", get(contacts::get).delete(contacts::delete))
        .route("/api/messages/send", post(messages::send_text))
        .route("/api/messages/template", post(messages::send_template))
        .route("/api/messages/bulk", post(messages::send_bulk))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
