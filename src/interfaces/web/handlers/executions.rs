use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
};

use super::{ApiResponse, caller_id, dispatch_error, internal_error};
use crate::core::dispatcher::ExecuteRequest;
use crate::interfaces::web::AppState;

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutePayload {
    pub agent_id: String,
    #[serde(default)]
    pub input: serde_json::Value,
    pub account_id: Option<String>,
}

#[derive(serde::Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

/// POST /api/executions. Synchronous: the response carries the terminal
/// outcome. A handled agent failure is still HTTP 200 with status `failed`;
/// 4xx/5xx are reserved for pre-flight rejections and dispatcher faults.
pub async fn execute_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ExecutePayload>,
) -> ApiResponse {
    let user_id = match caller_id(&headers) {
        Ok(id) => id,
        Err(rejection) => return rejection,
    };

    let request = ExecuteRequest {
        user_id,
        agent_id: payload.agent_id,
        input: payload.input,
        account_id: payload.account_id,
    };

    match state.dispatcher.execute(request).await {
        Ok(result) => {
            let mut body = match serde_json::to_value(&result) {
                Ok(v) => v,
                Err(e) => return internal_error(&anyhow::Error::from(e)),
            };
            body["success"] = serde_json::json!(true);
            (StatusCode::OK, Json(body))
        }
        Err(err) => dispatch_error(&err),
    }
}

/// GET /api/executions/{execution_id}. Visible to the requesting user and to
/// the agent's publisher.
pub async fn get_execution_endpoint(
    Path(execution_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResponse {
    let caller = match caller_id(&headers) {
        Ok(id) => id,
        Err(rejection) => return rejection,
    };

    let execution = match state.store.get_execution(&execution_id).await {
        Ok(Some(execution)) => execution,
        Ok(None) => return execution_not_found(&execution_id),
        Err(err) => return internal_error(&err),
    };

    if execution.user_id != caller {
        let publisher = match state.store.get_agent(&execution.agent_id).await {
            Ok(agent) => agent.map(|a| a.publisher_id),
            Err(err) => return internal_error(&err),
        };
        if publisher.as_deref() != Some(caller.as_str()) {
            // Hidden rather than forbidden: execution ids are not guessable
            // and existence itself is caller-private.
            return execution_not_found(&execution_id);
        }
    }

    (
        StatusCode::OK,
        Json(serde_json::json!({ "success": true, "execution": execution })),
    )
}

/// GET /api/executions. The caller's execution history, newest first.
pub async fn list_executions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> ApiResponse {
    let user_id = match caller_id(&headers) {
        Ok(id) => id,
        Err(rejection) => return rejection,
    };
    let limit = query.limit.unwrap_or(50).min(500);
    match state.store.executions_for_user(&user_id, limit).await {
        Ok(executions) => (
            StatusCode::OK,
            Json(serde_json::json!({ "success": true, "executions": executions })),
        ),
        Err(err) => internal_error(&err),
    }
}

/// GET /api/agents/{agent}/executions. Publisher-side view.
pub async fn agent_executions_endpoint(
    Path(agent_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> ApiResponse {
    let caller = match caller_id(&headers) {
        Ok(id) => id,
        Err(rejection) => return rejection,
    };
    let agent = match state.store.get_agent(&agent_id).await {
        Ok(Some(agent)) => agent,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({
                    "success": false,
                    "code": "AgentNotFound",
                    "error": format!("agent not found: {agent_id}"),
                })),
            );
        }
        Err(err) => return internal_error(&err),
    };
    if agent.publisher_id != caller {
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({
                "success": false,
                "code": "NotPublisher",
                "error": "only the publisher can list an agent's executions",
            })),
        );
    }

    let limit = query.limit.unwrap_or(50).min(500);
    match state.store.executions_for_agent(&agent_id, limit).await {
        Ok(executions) => (
            StatusCode::OK,
            Json(serde_json::json!({ "success": true, "executions": executions })),
        ),
        Err(err) => internal_error(&err),
    }
}

fn execution_not_found(execution_id: &str) -> ApiResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({
            "success": false,
            "code": "ExecutionNotFound",
            "error": format!("execution not found: {execution_id}"),
        })),
    )
}
