//! Admin endpoints: credential CRUD, pool stats, health view.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::AppState;
use crate::credentials::RegistryError;
use crate::error::{GatewayError, GatewayResult};
use crate::store::{Credential, Health, Provider};

fn parse_provider(raw: &str) -> GatewayResult<Provider> {
    Provider::parse(raw).ok_or_else(|| GatewayError::bad_request(format!("unknown provider: {raw}")))
}

fn registry_err(e: RegistryError) -> GatewayError {
    match e {
        RegistryError::NotFound => GatewayError::bad_request("credential not found"),
        RegistryError::AlreadyExists(msg) => GatewayError::bad_request(msg),
        RegistryError::Backend(err) => GatewayError::unavailable(err.to_string()),
    }
}

pub async fn list_credentials(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
) -> GatewayResult<Json<Vec<Credential>>> {
    let provider = parse_provider(&provider)?;
    Ok(Json(state.registry.list(provider).await.map_err(registry_err)?))
}

pub async fn add_credential(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    Json(credential): Json<Credential>,
) -> GatewayResult<Json<Value>> {
    let provider = parse_provider(&provider)?;
    if credential.provider != provider {
        return Err(GatewayError::bad_request("credential provider does not match path"));
    }
    state.registry.add(credential).await.map_err(registry_err)?;
    Ok(Json(json!({ "status": "created" })))
}

#[derive(Debug, Deserialize)]
pub struct SetActiveRequest {
    pub active: bool,
}

pub async fn set_active(
    State(state): State<Arc<AppState>>,
    Path((provider, id)): Path<(String, String)>,
    Json(req): Json<SetActiveRequest>,
) -> GatewayResult<Json<Value>> {
    let provider = parse_provider(&provider)?;
    state
        .registry
        .toggle_active(provider, &id, req.active)
        .await
        .map_err(registry_err)?;
    Ok(Json(json!({ "status": "updated" })))
}

pub async fn delete_credential(
    State(state): State<Arc<AppState>>,
    Path((provider, id)): Path<(String, String)>,
) -> GatewayResult<Json<Value>> {
    let provider = parse_provider(&provider)?;
    state.registry.delete(provider, &id).await.map_err(registry_err)?;
    Ok(Json(json!({ "status": "deleted" })))
}

pub async fn pool_stats(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
) -> GatewayResult<Json<crate::credentials::PoolStats>> {
    let provider = parse_provider(&provider)?;
    Ok(Json(state.registry.stats(provider).await.map_err(registry_err)?))
}

pub async fn health_view(
    State(state): State<Arc<AppState>>,
    Path((provider, id)): Path<(String, String)>,
) -> GatewayResult<Json<Health>> {
    let provider = parse_provider(&provider)?;
    let health = state
        .health
        .get(provider, &id)
        .await
        .map_err(|e| GatewayError::unavailable(e.to_string()))?;
    Ok(Json(health))
}
