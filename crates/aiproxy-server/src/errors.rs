//! Maps [`ProxyError`] onto the OpenAI-compatible error envelope:
//! `{"error": {"message", "type", "code"}}` with a matching HTTP status,
//! using the redacted message so internal detail never reaches a client.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use aiproxy_core::ProxyError;

pub fn error_response(err: &ProxyError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (
        status,
        Json(serde_json::json!({
            "error": {
                "message": err.redacted_message(),
                "type": err.error_type(),
                "param": serde_json::Value::Null,
                "code": status.as_u16(),
            }
        })),
    )
        .into_response();

    if let ProxyError::RateLimit { retry_after } = err {
        if let Ok(value) = HeaderValue::from_str(&retry_after.as_secs().to_string()) {
            response.headers_mut().insert("Retry-After", value);
        }
    }
    response
}
