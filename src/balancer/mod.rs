//! Consistent-hash load balancer (C10): fronts N gateway instances,
//! stickying each client IP to a backend and failing over on health
//! changes.

pub mod health;
pub mod proxy;
pub mod registry;
pub mod status;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{any, get};
use axum::Router;

use crate::config::BalancerConfig;
use proxy::BalancerState;
use registry::{resolve, BackendRegistry};

/// Resolves the configured backends, then binds and serves until a
/// shutdown signal arrives, running the active-probe, DNS-refresh, and
/// IP-mapping-GC loops alongside it.
pub async fn serve(config: BalancerConfig) -> anyhow::Result<()> {
    let backends = resolve(&config.discovery).await;
    if backends.is_empty() {
        tracing::warn!("balancer starting with an empty backend list");
    }
    let registry = Arc::new(BackendRegistry::new(backends));
    let http = reqwest::Client::builder().build()?;

    tokio::spawn(health::probe_loop(Arc::clone(&registry), http.clone()));
    tokio::spawn(health::dns_refresh_loop(Arc::clone(&registry), config.discovery.clone()));
    tokio::spawn(health::ip_mapping_gc_loop(Arc::clone(&registry)));

    let state = Arc::new(BalancerState { registry, http });
    let app = Router::new()
        .route("/health", get(status::health))
        .route("/lb", get(status::status_page))
        .route("/lb/status", get(status::status_json))
        .fallback(any(proxy::proxy))
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "balancer listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}
