//! Outbound message routes under `/api/messages`.
//!
//! All of them answer 503 when outbound credentials are not configured.

use axum::{body::Bytes, extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::outbound::{BulkRecipient, GraphClient, SendError};
use crate::web::error::{parse_json, ApiError};
use crate::web::AppState;

#[derive(Debug, Deserialize)]
pub struct SendText {
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct SendTemplate {
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub template_name: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub parameters: Vec<String>,
}

fn default_language() -> String {
    "es".to_string()
}

#[derive(Debug, Deserialize)]
pub struct SendBulk {
    #[serde(default)]
    pub recipients: Vec<BulkRecipient>,
}

fn client(state: &AppState) -> Result<&GraphClient, ApiError> {
    state
        .outbound
        .as_ref()
        .ok_or(ApiError::Outbound(SendError::NotConfigured("PHONE_NUMBER_ID/ACCESS_TOKEN")))
}

pub async fn send_text(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let client = client(&state)?;
    let request: SendText = parse_json(&body)?;
    if request.phone.is_empty() || request.message.is_empty() {
        return Err(ApiError::BadRequest("phone and message are required".to_string()));
    }

    let data = client.send_text(&request.phone, &request.message).await?;
    Ok(Json(json!({ "success": true, "message": "message sent", "data": data })))
}

pub async fn send_template(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let client = client(&state)?;
    let request: SendTemplate = parse_json(&body)?;
    if request.phone.is_empty() || request.template_name.is_empty() {
        return Err(ApiError::BadRequest("phone and template_name are required".to_string()));
    }

    let data = client
        .send_template(&request.phone, &request.template_name, &request.language, &request.parameters)
        .await?;
    Ok(Json(json!({ "success": true, "message": "template sent", "data": data })))
}

pub async fn send_bulk(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let client = client(&state)?;
    let request: SendBulk = parse_json(&body)?;
    if request.recipients.is_empty() {
        return Err(ApiError::BadRequest("recipients is required".to_string()));
    }
    if request
        .recipients
        .iter()
        .any(|r| r.phone.is_empty() || r.message.is_empty())
    {
        return Err(ApiError::BadRequest("each recipient needs phone and message".to_string()));
    }

    let report = client.send_bulk(request.recipients).await;
    Ok(Json(json!({ "success": true, "message": "bulk send complete", "result": report })))
}
