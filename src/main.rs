//! Gateway HTTP server entry point.

use std::sync::Arc;

use llm_gateway::api::AppState;
use llm_gateway::config::Config;
use llm_gateway::store::memory::MemoryStore;
use llm_gateway::store::mysql::MySqlStore;
use llm_gateway::store::Store;
use llm_gateway::{api, background};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_gateway=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let store: Arc<dyn Store> = if std::env::var("GATEWAY_MEMORY_STORE").is_ok() {
        info!("using in-memory store (GATEWAY_MEMORY_STORE set)");
        Arc::new(MemoryStore::new().await?)
    } else {
        Arc::new(MySqlStore::connect(&config.database).await?)
    };

    let state = AppState::new(Arc::clone(&store), config)?;

    background::spawn_all(
        store,
        Arc::clone(&state.registry),
        Arc::clone(&state.settings),
        Arc::clone(&state.token_manager),
        Arc::clone(&state.health),
    );

    info!(host = %state.config.host, port = state.config.port, "starting gateway");

    api::run(state).await
}
