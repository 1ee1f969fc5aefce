//! The balancer's own tiny HTTP surface: aggregate health, an operator
//! status page, and the machine-readable per-backend JSON behind it.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use serde_json::json;

use super::proxy::BalancerState;

/// `200 {status:'ok'}` when at least one backend is healthy, else
/// `503 {status:'error'}`.
pub async fn health(State(state): State<Arc<BalancerState>>) -> Response {
    if state.registry.healthy_indices().is_empty() && !state.registry.is_empty() {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "error" }))).into_response()
    } else {
        Json(json!({ "status": "ok" })).into_response()
    }
}

/// Per-backend reachability, latency, and last-check time.
pub async fn status_json(State(state): State<Arc<BalancerState>>) -> Json<serde_json::Value> {
    let backends: Vec<_> = state
        .registry
        .snapshot()
        .iter()
        .map(|b| {
            json!({
                "addr": b.addr(),
                "healthy": b.healthy,
                "last_latency_ms": b.last_latency_ms,
                "last_check_ms_ago": b.last_check.map(|t| t.elapsed().as_millis() as u64),
            })
        })
        .collect();
    Json(json!({ "backends": backends }))
}

/// A minimal operator status page rendering the same data as [`status_json`].
pub async fn status_page(State(state): State<Arc<BalancerState>>) -> Html<String> {
    let rows: String = state
        .registry
        .snapshot()
        .iter()
        .map(|b| {
            let latency = b
                .last_latency_ms
                .map(|ms| format!("{ms} ms"))
                .unwrap_or_else(|| "-".to_string());
            let last_check = b
                .last_check
                .map(|t| format!("{}s ago", t.elapsed().as_secs()))
                .unwrap_or_else(|| "never".to_string());
            format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                b.addr(),
                if b.healthy { "healthy" } else { "unhealthy" },
                latency,
                last_check,
            )
        })
        .collect();

    Html(format!(
        "<html><body><h1>balancer status</h1><table border=\"1\">\
         <tr><th>backend</th><th>status</th><th>latency</th><th>last check</th></tr>{rows}</table></body></html>"
    ))
}
