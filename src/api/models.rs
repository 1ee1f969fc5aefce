//! `GET /v1/models`: lists the client-facing model names the
//! gateway knows how to route, drawn from the built-in alias table.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use super::AppState;
use crate::providers::model_alias::{built_in_catalog, resolve_provider};

pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<Value> {
    let settings = state.settings.get().await;
    let data: Vec<Value> = built_in_catalog()
        .into_iter()
        .map(|id| {
            let owned_by = resolve_provider(&settings, &id).as_str();
            json!({ "id": id, "object": "model", "owned_by": owned_by })
        })
        .collect();
    Json(json!({ "object": "list", "data": data }))
}
