//! Webhook and health endpoint handlers.
//!
//! The webhook receiver is designed to be fast. It only:
//! 1. Verifies the signature
//! 2. Tags the payload with cached contact info
//! 3. Hands it to the relay and returns
//!
//! Delivery to the WebSocket consumer happens in the background processor.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::contacts::ContactCache;
use crate::outbound::GraphClient;
use crate::relay::{PayloadSummary, Relay};
use crate::web::error::ApiError;
use crate::web::signature::{is_signature_verification_enabled, verify_hub_signature, SIGNATURE_HEADER};
use crate::Config;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub relay: Arc<Relay>,
    pub contacts: Arc<ContactCache>,
    /// Present only when outbound credentials are configured
    pub outbound: Option<GraphClient>,
}

impl AppState {
    pub fn new(
        config: Config,
        relay: Arc<Relay>,
        contacts: Arc<ContactCache>,
        outbound: Option<GraphClient>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            relay,
            contacts,
            outbound,
        }
    }
}

// =============================================================================
// Health Check
// =============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Debug, Serialize)]
pub struct ServiceFlags {
    pub webhook: bool,
    pub relay_consumer: bool,
    pub websocket: bool,
    pub outbound: bool,
}

#[derive(Debug, Serialize)]
pub struct ServiceStatus {
    pub status: &'static str,
    pub services: ServiceFlags,
}

/// Aggregate health: 200 when every service is up, 503 otherwise.
///
/// Also revives the relay consumer if it has died.
pub async fn service_status(State(state): State<AppState>) -> impl IntoResponse {
    let relay = state.relay.status().await;

    let services = ServiceFlags {
        webhook: true,
        relay_consumer: relay.consumer_alive,
        websocket: relay.sink_reachable,
        outbound: state.outbound.is_some(),
    };
    let healthy = services.relay_consumer && services.websocket && services.outbound;

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(ServiceStatus {
            status: if healthy { "healthy" } else { "degraded" },
            services,
        }),
    )
}

// =============================================================================
// Webhook
// =============================================================================

/// Query of the subscription handshake.
#[derive(Debug, Default, Deserialize)]
pub struct VerifyParams {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// Subscription handshake: echo the challenge when mode and token match.
pub async fn verify_webhook(
    State(state): State<AppState>,
    Query(params): Query<VerifyParams>,
) -> (StatusCode, String) {
    let subscribe = params.mode.as_deref() == Some("subscribe");
    let token_ok = params.verify_token.as_deref() == Some(state.config.verify_token.as_str());

    if subscribe && token_ok {
        info!("webhook_verified");
        (StatusCode::OK, params.challenge.unwrap_or_default())
    } else {
        warn!(mode = ?params.mode, "webhook_verification_failed");
        (StatusCode::FORBIDDEN, "verification failed".to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub message: &'static str,
    pub accepted: bool,
    pub method: &'static str,
}

/// Webhook receiver.
///
/// Takes the raw body so the signature is checked over the exact bytes
/// the platform signed.
pub async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, ApiError> {
    if is_signature_verification_enabled(&state.config.app_secret) {
        let secret = state.config.app_secret.as_deref().unwrap_or_default();
        let header = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
        if !verify_hub_signature(secret, &body, header) {
            return Err(ApiError::Unauthorized);
        }
    }

    let mut payload = match serde_json::from_slice::<Value>(&body) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            warn!(body_length = body.len(), "webhook_not_an_object");
            return Err(ApiError::BadRequest("webhook body must be a JSON object".to_string()));
        }
        Err(e) => {
            warn!(body_length = body.len(), error = %e, "webhook_invalid_json");
            return Err(ApiError::BadRequest(format!("invalid JSON body: {e}")));
        }
    };

    let summary = PayloadSummary::of(&payload);
    info!(
        sender = %summary.sender,
        preview = %summary.preview,
        body_length = body.len(),
        "webhook_received"
    );

    state.contacts.enrich(&mut payload);
    let receipt = state.relay.submit(payload);

    Ok(Json(WebhookResponse {
        message: "webhook queued for relay",
        accepted: receipt.accepted,
        method: receipt.method,
    }))
}
