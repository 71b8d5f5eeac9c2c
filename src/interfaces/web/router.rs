use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;

use super::AppState;
use super::handlers::{accounts, agents, credits, executions};

fn build_localhost_cors(api_port: u16) -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{}", api_port),
        format!("http://localhost:{}", api_port),
    ]
    .iter()
    .filter_map(|o| o.parse().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
}

pub fn build_api_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/executions",
            get(executions::list_executions).post(executions::execute_endpoint),
        )
        .route(
            "/api/executions/{execution_id}",
            get(executions::get_execution_endpoint),
        )
        .route(
            "/api/agents",
            get(agents::list_agents).post(agents::register_agent_endpoint),
        )
        .route("/api/agents/{agent}", get(agents::get_agent_endpoint))
        .route(
            "/api/agents/{agent}/status",
            post(agents::set_agent_status_endpoint),
        )
        .route(
            "/api/agents/{agent}/executions",
            get(executions::agent_executions_endpoint),
        )
        .route("/api/accounts", post(accounts::connect_account_endpoint))
        .route(
            "/api/accounts/{account}/status",
            post(accounts::set_account_status_endpoint),
        )
        .route("/api/credits", get(credits::get_credits_endpoint))
        .route("/api/credits/grant", post(credits::grant_credits_endpoint))
        .layer(middleware::from_fn(security_headers))
        .layer(build_localhost_cors(state.api_port))
        .with_state(state)
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'self'"),
    );
    response
}
