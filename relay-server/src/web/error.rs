//! JSON failure envelope shared by the API routes.

use axum::{
    body::Bytes,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::error;

use crate::contacts::ContactError;
use crate::outbound::SendError;

/// Every API failure renders as `{"success": false, "error": "..."}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("invalid signature")]
    Unauthorized,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unavailable(String),

    #[error(transparent)]
    Outbound(#[from] SendError),

    #[error("contact storage failed: {0}")]
    Contacts(#[from] ContactError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Outbound(SendError::NotConfigured(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Outbound(SendError::Api { .. }) => StatusCode::BAD_REQUEST,
            ApiError::Outbound(SendError::Http(_)) => StatusCode::BAD_GATEWAY,
            ApiError::Contacts(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "api_error");
        }
        (status, Json(json!({ "success": false, "error": self.to_string() }))).into_response()
    }
}

/// Parse a JSON request body, mapping malformed input to a 400.
///
/// An empty body parses as `null`, so an `Option<T>` target reads it as
/// `None`.
pub fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    let body: &[u8] = if body.iter().all(u8::is_ascii_whitespace) {
        b"null"
    } else {
        &body[..]
    };
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Default, Deserialize)]
    #[serde(default)]
    struct Limit {
        limit: Option<usize>,
    }

    #[test]
    fn test_parse_json_empty_body_is_null() {
        let parsed: Option<Limit> = parse_json(&Bytes::new()).unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn test_parse_json_rejects_garbage() {
        let err = parse_json::<Limit>(&Bytes::from_static(b"{nope")).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_parse_json_reads_fields() {
        let parsed: Limit = parse_json(&Bytes::from_static(br#"{"limit": 3}"#)).unwrap();
        assert_eq!(parsed.limit, Some(3));
    }

    #[test]
    fn test_send_errors_map_to_status() {
        assert_eq!(
            ApiError::from(SendError::NotConfigured("ACCESS_TOKEN")).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(SendError::Api { status: 400, body: "bad".into() }).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_contact_storage_errors_are_server_errors() {
        let err = ApiError::from(ContactError::Database(rusqlite::Error::InvalidQuery));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
