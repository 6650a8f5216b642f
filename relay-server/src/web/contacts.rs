//! Contact cache routes under `/api/numbers`.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::web::error::{parse_json, ApiError};
use crate::web::AppState;

#[derive(Debug, Deserialize)]
pub struct NewContact {
    pub phone: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub data: Value,
}

pub async fn list(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let numbers = state.contacts.list()?;
    Ok(Json(json!({ "success": true, "total": numbers.len(), "numbers": numbers })))
}

pub async fn get(State(state): State<AppState>, Path(phone): Path<String>) -> Result<Json<Value>, ApiError> {
    state
        .contacts
        .get(&phone)?
        .map(|number| Json(json!({ "success": true, "number": number })))
        .ok_or_else(|| ApiError::NotFound("number not found".to_string()))
}

pub async fn add(State(state): State<AppState>, body: Bytes) -> Result<(StatusCode, Json<Value>), ApiError> {
    let request: NewContact = parse_json(&body)?;
    let phone = request
        .phone
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::BadRequest("phone is required".to_string()))?;

    let number = state.contacts.upsert(&phone, request.name, request.data)?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": format!("number {phone} saved"),
            "number": number,
        })),
    ))
}

pub async fn delete(State(state): State<AppState>, Path(phone): Path<String>) -> Result<Json<Value>, ApiError> {
    if state.contacts.delete(&phone)? {
        Ok(Json(json!({ "success": true, "message": format!("number {phone} deleted") })))
    } else {
        Err(ApiError::NotFound("number not found".to_string()))
    }
}

pub async fn clear(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let deleted = state.contacts.clear()?;
    Ok(Json(json!({
        "success": true,
        "deleted": deleted,
        "message": format!("deleted {deleted} numbers"),
    })))
}
