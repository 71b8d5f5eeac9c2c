mod handlers;
mod router;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::core::dispatcher::Dispatcher;
use crate::core::store::Store;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) store: Arc<Store>,
    pub(crate) api_port: u16,
}

/// Binds the API server and serves until the process exits. Identity is the
/// `X-User-Id` header; the gateway in front of this service is what actually
/// authenticates callers.
pub async fn serve(dispatcher: Arc<Dispatcher>, api_host: &str, api_port: u16) -> Result<()> {
    let state = AppState {
        store: dispatcher.store().clone(),
        dispatcher,
        api_port,
    };
    let app = router::build_api_router(state);

    let addr = format!("{api_host}:{api_port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("API Server running at http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
