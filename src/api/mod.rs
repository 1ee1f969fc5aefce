//! Gateway HTTP server: axum router, bearer-API-key auth, and the
//! `/v1/messages` / `/v1/chat/completions` request lifecycle.
//!
//! `AppState` holds `Arc`-wrapped subsystem handles shared across requests;
//! public and protected routes are merged and the auth layer applied with
//! `middleware::from_fn_with_state`; bootstrap binds a `TcpListener` and
//! serves with `axum::serve(...).with_graceful_shutdown(...)`.

pub mod admin;
pub mod auth;
pub mod messages;
pub mod models;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use tokio::sync::{Mutex, Semaphore};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::Config;
use crate::credentials::CredentialRegistry;
use crate::health::HealthTracker;
use crate::selection::SelectionEngine;
use crate::settings::SettingsStore;
use crate::store::Store;
use crate::token::TokenManager;

/// Per-API-key concurrency limiter: one [`Semaphore`] created lazily per
/// key, sized from `ApiKeyLimits.concurrent` the first time that key is
/// seen.
#[derive(Default)]
pub struct ConcurrencyLimiter {
    permits: Mutex<HashMap<Uuid, Arc<Semaphore>>>,
}

impl ConcurrencyLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn semaphore_for(&self, key_id: Uuid, limit: u32) -> Arc<Semaphore> {
        let mut guard = self.permits.lock().await;
        Arc::clone(
            guard
                .entry(key_id)
                .or_insert_with(|| Arc::new(Semaphore::new(limit.max(1) as usize))),
        )
    }
}

/// Shared application state, handed to every handler via axum's `State`
/// extractor.
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub settings: Arc<SettingsStore>,
    pub registry: Arc<CredentialRegistry>,
    pub health: Arc<HealthTracker>,
    pub selection: Arc<SelectionEngine>,
    pub token_manager: Arc<TokenManager>,
    pub http: reqwest::Client,
    pub concurrency: ConcurrencyLimiter,
    pub config: Config,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, config: Config) -> anyhow::Result<Arc<Self>> {
        let settings = Arc::new(SettingsStore::new(Arc::clone(&store)));
        let http = reqwest::Client::builder()
            .connect_timeout(config.upstream_connect_timeout)
            .timeout(config.upstream_read_timeout)
            .build()?;

        Ok(Arc::new(Self {
            registry: Arc::new(CredentialRegistry::new(Arc::clone(&store))),
            health: Arc::new(HealthTracker::new(Arc::clone(&store))),
            selection: Arc::new(SelectionEngine::new(Arc::clone(&store), Arc::clone(&settings))),
            token_manager: Arc::new(TokenManager::new(http.clone())),
            store,
            settings,
            http,
            concurrency: ConcurrencyLimiter::new(),
            config,
        }))
    }
}

/// Builds the full router: an unauthenticated `/health` probe plus the
/// bearer-API-key-protected chat and admin surface.
pub fn router(state: Arc<AppState>) -> Router {
    let public_routes = Router::new().route("/health", get(health));

    let protected_routes = Router::new()
        .route("/v1/messages", post(messages::create_message))
        .route("/v1/chat/completions", post(messages::create_chat_completion))
        .route("/v1/models", get(models::list_models))
        .route(
            "/admin/credentials/:provider",
            get(admin::list_credentials).post(admin::add_credential),
        )
        .route(
            "/admin/credentials/:provider/:id",
            axum::routing::delete(admin::delete_credential),
        )
        .route("/admin/credentials/:provider/:id/active", post(admin::set_active))
        .route("/admin/pool-stats/:provider", get(admin::pool_stats))
        .route("/admin/health/:provider/:id", get(admin::health_view))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_api_key,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Pings the store so the balancer's active probe can observe a gateway
/// instance that has lost its database connection as unhealthy.
async fn health(State(state): State<Arc<AppState>>) -> Response {
    match state.store.ping().await {
        Ok(()) => Json(serde_json::json!({ "status": "ok" })).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "health check store ping failed");
            (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({ "status": "error" }))).into_response()
        }
    }
}

/// Binds and serves the gateway until a shutdown signal arrives. Builds its
/// own [`AppState`]; callers that need to share its subsystem handles with
/// other tasks (e.g. the background sweepers) should build an `AppState`
/// themselves and call [`run`] instead.
pub async fn serve(config: Config, store: Arc<dyn Store>) -> anyhow::Result<()> {
    let state = AppState::new(store, config)?;
    run(state).await
}

/// Binds and serves a pre-built [`AppState`] until a shutdown signal arrives.
pub async fn run(state: Arc<AppState>) -> anyhow::Result<()> {
    let app = router(Arc::clone(&state));

    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received, draining in-flight requests");
}
