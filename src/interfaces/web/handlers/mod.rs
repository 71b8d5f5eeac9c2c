pub mod accounts;
pub mod agents;
pub mod credits;
pub mod executions;

use axum::Json;
use axum::http::{HeaderMap, StatusCode};

use crate::core::errors::DispatchError;

pub(crate) type ApiResponse = (StatusCode, Json<serde_json::Value>);

/// Caller identity. The upstream gateway authenticates and injects
/// `X-User-Id`; requests arriving without it are rejected outright.
pub(crate) fn caller_id(headers: &HeaderMap) -> Result<String, ApiResponse> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({
                    "success": false,
                    "code": "MissingIdentity",
                    "error": "X-User-Id header is required"
                })),
            )
        })
}

pub(crate) fn dispatch_error(err: &DispatchError) -> ApiResponse {
    let mut body = serde_json::json!({
        "success": false,
        "code": err.code(),
        "error": err.to_string(),
    });
    if let DispatchError::InvalidInput(violations) = err {
        body["violations"] = serde_json::json!(violations);
    }
    (err.http_status(), Json(body))
}

pub(crate) fn internal_error(err: &anyhow::Error) -> ApiResponse {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({
            "success": false,
            "code": "Internal",
            "error": err.to_string(),
        })),
    )
}

pub(crate) fn bad_request(message: &str) -> ApiResponse {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({
            "success": false,
            "code": "InvalidInput",
            "error": message,
        })),
    )
}
