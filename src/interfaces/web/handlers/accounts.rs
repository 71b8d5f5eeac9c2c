use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
};

use super::{ApiResponse, bad_request, caller_id, internal_error};
use crate::core::store::types::{AccountStatus, Platform};
use crate::interfaces::web::AppState;

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub agent_id: String,
    pub platform: String,
}

#[derive(serde::Deserialize)]
pub struct SetStatusRequest {
    pub status: String,
}

/// POST /api/accounts. Records the result of the external OAuth flow for
/// (caller, agent, platform); reconnecting refreshes an expired account.
pub async fn connect_account_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ConnectRequest>,
) -> ApiResponse {
    let user_id = match caller_id(&headers) {
        Ok(id) => id,
        Err(rejection) => return rejection,
    };
    let Some(platform) = Platform::from_status(&payload.platform) else {
        return bad_request(&format!("unknown platform '{}'", payload.platform));
    };

    match state
        .store
        .connect_account(&user_id, &payload.agent_id, platform)
        .await
    {
        Ok(account) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "success": true, "account": account })),
        ),
        Err(err) => internal_error(&err),
    }
}

/// POST /api/accounts/{account}/status. Marks a connection expired or
/// errored (token refresh failures land here); owner-only.
pub async fn set_account_status_endpoint(
    Path(account_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<SetStatusRequest>,
) -> ApiResponse {
    let caller = match caller_id(&headers) {
        Ok(id) => id,
        Err(rejection) => return rejection,
    };
    let Some(status) = AccountStatus::from_status(&payload.status) else {
        return bad_request(&format!("unknown account status '{}'", payload.status));
    };

    let account = match state.store.get_account(&account_id).await {
        Ok(Some(account)) => account,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({
                    "success": false,
                    "code": "AccountNotFound",
                    "error": format!("account not found: {account_id}"),
                })),
            );
        }
        Err(err) => return internal_error(&err),
    };
    if account.user_id != caller {
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({
                "success": false,
                "code": "NotOwner",
                "error": "only the owning user can change account status",
            })),
        );
    }

    match state.store.set_account_status(&account_id, status).await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({ "success": true, "status": status })),
        ),
        Err(err) => internal_error(&err),
    }
}
