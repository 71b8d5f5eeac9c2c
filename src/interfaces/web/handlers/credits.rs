use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
};

use super::{ApiResponse, bad_request, caller_id, internal_error};
use crate::interfaces::web::AppState;

#[derive(serde::Deserialize)]
pub struct GrantRequest {
    pub amount: i64,
}

/// GET /api/credits. Balance plus the full transaction history for the
/// caller (as user and, for publishers, settlement income).
pub async fn get_credits_endpoint(State(state): State<AppState>, headers: HeaderMap) -> ApiResponse {
    let account_id = match caller_id(&headers) {
        Ok(id) => id,
        Err(rejection) => return rejection,
    };
    let balance = match state.store.balance(&account_id).await {
        Ok(b) => b,
        Err(err) => return internal_error(&err),
    };
    match state.store.transactions_for_account(&account_id).await {
        Ok(transactions) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "success": true,
                "balance": balance,
                "transactions": transactions,
            })),
        ),
        Err(err) => internal_error(&err),
    }
}

/// POST /api/credits/grant. Top-up entry point for the (external) purchase
/// flow; amounts must be positive.
pub async fn grant_credits_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<GrantRequest>,
) -> ApiResponse {
    let account_id = match caller_id(&headers) {
        Ok(id) => id,
        Err(rejection) => return rejection,
    };
    if payload.amount <= 0 {
        return bad_request("grant amount must be positive");
    }
    match state.store.grant_credits(&account_id, payload.amount).await {
        Ok(balance) => (
            StatusCode::OK,
            Json(serde_json::json!({ "success": true, "balance": balance })),
        ),
        Err(err) => internal_error(&err),
    }
}
