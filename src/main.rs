mod core;
mod interfaces;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::core::config::DispatcherConfig;
use crate::core::dispatcher::invoker::TokioClock;
use crate::core::dispatcher::{Dispatcher, reconcile};
use crate::core::store::Store;

fn db_path() -> std::path::PathBuf {
    if let Ok(path) = std::env::var("AGORA_DB_PATH") {
        return std::path::PathBuf::from(path);
    }
    dirs::data_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("agora")
        .join("agora.db")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = DispatcherConfig::from_env();
    let store = Arc::new(Store::open(db_path())?);
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        config.clone(),
        Arc::new(TokioClock),
    ));

    // Settles reservations orphaned by a crash; runs for the process lifetime.
    let _sweeper = reconcile::spawn_sweeper(store, config);

    let api_host = std::env::var("AGORA_API_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let api_port: u16 = std::env::var("AGORA_API_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(17950);

    info!("Starting agora dispatcher");
    interfaces::web::serve(dispatcher, &api_host, api_port).await
}
