use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
};

use super::{ApiResponse, bad_request, caller_id, dispatch_error, internal_error};
use crate::core::store::catalog::NewAgent;
use crate::core::store::types::{AgentStatus, Platform};
use crate::interfaces::web::AppState;

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAgentRequest {
    pub name: String,
    pub webhook_url: String,
    pub webhook_secret: String,
    pub price: Option<i64>,
    pub platform: Option<String>,
    pub input_schema: Option<serde_json::Value>,
}

#[derive(serde::Deserialize)]
pub struct SetStatusRequest {
    pub status: String,
}

/// POST /api/agents. The caller is the publisher; the webhook is probed once
/// before the agent lands in the catalog (as draft).
pub async fn register_agent_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<RegisterAgentRequest>,
) -> ApiResponse {
    let publisher_id = match caller_id(&headers) {
        Ok(id) => id,
        Err(rejection) => return rejection,
    };

    let name = payload.name.trim().to_string();
    if name.is_empty() {
        return bad_request("agent name is required");
    }
    if !payload.webhook_url.starts_with("http://") && !payload.webhook_url.starts_with("https://") {
        return bad_request("webhookUrl must be an http(s) URL");
    }
    if payload.webhook_secret.trim().is_empty() {
        return bad_request("webhookSecret is required");
    }
    let price = payload
        .price
        .unwrap_or(state.dispatcher.config().default_agent_price);
    if price <= 0 {
        return bad_request("price must be a positive credit amount");
    }
    let platform = match payload.platform.as_deref() {
        Some(raw) => match Platform::from_status(raw) {
            Some(p) => Some(p),
            None => return bad_request(&format!("unknown platform '{raw}'")),
        },
        None => None,
    };

    let new_agent = NewAgent {
        publisher_id,
        name,
        webhook_url: payload.webhook_url,
        webhook_secret: payload.webhook_secret,
        price,
        platform,
        input_schema: payload.input_schema.unwrap_or(serde_json::json!({})),
    };

    match state.dispatcher.register_agent(new_agent).await {
        Ok(agent) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "success": true, "agent": agent })),
        ),
        Err(err) => dispatch_error(&err),
    }
}

/// GET /api/agents. The caller's own published agents.
pub async fn list_agents(State(state): State<AppState>, headers: HeaderMap) -> ApiResponse {
    let publisher_id = match caller_id(&headers) {
        Ok(id) => id,
        Err(rejection) => return rejection,
    };
    match state.store.agents_for_publisher(&publisher_id).await {
        Ok(agents) => (
            StatusCode::OK,
            Json(serde_json::json!({ "success": true, "agents": agents })),
        ),
        Err(err) => internal_error(&err),
    }
}

pub async fn get_agent_endpoint(
    Path(agent_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResponse {
    match state.store.get_agent(&agent_id).await {
        Ok(Some(agent)) => (
            StatusCode::OK,
            Json(serde_json::json!({ "success": true, "agent": agent })),
        ),
        Ok(None) => agent_not_found(&agent_id),
        Err(err) => internal_error(&err),
    }
}

/// POST /api/agents/{agent}/status. Publisher-only; an active/disabled toggle
/// takes effect on the next execution request.
pub async fn set_agent_status_endpoint(
    Path(agent_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<SetStatusRequest>,
) -> ApiResponse {
    let publisher_id = match caller_id(&headers) {
        Ok(id) => id,
        Err(rejection) => return rejection,
    };
    let Some(status) = AgentStatus::from_status(&payload.status) else {
        return bad_request(&format!("unknown agent status '{}'", payload.status));
    };

    let agent = match state.store.get_agent(&agent_id).await {
        Ok(Some(agent)) => agent,
        Ok(None) => return agent_not_found(&agent_id),
        Err(err) => return internal_error(&err),
    };
    if agent.publisher_id != publisher_id {
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({
                "success": false,
                "code": "NotPublisher",
                "error": "only the publisher can change agent status",
            })),
        );
    }

    match state.store.set_agent_status(&agent_id, status).await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({ "success": true, "status": status })),
        ),
        Err(err) => internal_error(&err),
    }
}

fn agent_not_found(agent_id: &str) -> ApiResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({
            "success": false,
            "code": "AgentNotFound",
            "error": format!("agent not found: {agent_id}"),
        })),
    )
}
