//! Operator routes over the relay queue.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::relay::Payload;
use crate::web::error::{parse_json, ApiError};
use crate::web::AppState;

const DEFAULT_RETRY_LIMIT: usize = 10;

pub async fn status(State(state): State<AppState>) -> Json<Value> {
    let status = state.relay.status().await;
    let lengths = state.relay.lengths();
    Json(json!({ "success": true, "status": status, "queue_lengths": lengths }))
}

pub async fn lengths(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "success": true, "queue_lengths": state.relay.lengths() }))
}

/// 200 when the new consumer came up, 500 otherwise.
pub async fn restart(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let report = state.relay.restart().await;
    let code = if report.ok {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (code, Json(json!({ "success": report.ok, "message": report.message })))
}

pub async fn clear(State(state): State<AppState>) -> Json<Value> {
    let report = state.relay.clear();
    Json(json!({ "success": true, "result": report }))
}

/// Push a synthetic message through the relay.
pub async fn test_message(State(state): State<AppState>) -> Json<Value> {
    let message = json!({
        "from": "test_user",
        "type": "text",
        "text": "relay queue test message",
        "timestamp": Utc::now().timestamp().to_string(),
    });

    let payload: Payload = message.as_object().cloned().unwrap_or_default();
    let receipt = state.relay.submit(payload);
    info!("relay_test_message_submitted");

    Json(json!({ "success": true, "result": receipt, "test_message": message }))
}

#[derive(Debug, Deserialize)]
pub struct RetryRequest {
    pub limit: Option<usize>,
}

/// Requeue dead letters; body `{"limit": n}` is optional.
pub async fn retry_failed(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let request: Option<RetryRequest> = parse_json(&body)?;
    let limit = request
        .and_then(|r| r.limit)
        .unwrap_or(DEFAULT_RETRY_LIMIT);

    let report = state.relay.retry_dead_letters(limit);
    Ok(Json(json!({ "success": true, "result": report })))
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    pub limit: Option<usize>,
}

pub async fn dead_letters(State(state): State<AppState>, Query(query): Query<DeadLetterQuery>) -> Json<Value> {
    let letters = state.relay.dead_letters(query.limit.unwrap_or(50));
    Json(json!({ "success": true, "total": letters.len(), "dead_letters": letters }))
}
