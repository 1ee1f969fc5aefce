//! Client-IP extraction, consistent-hash backend selection, and the
//! request-forwarding handler.
//!
//! Forwarding builds a `reqwest::RequestBuilder`, forwards the body
//! byte-for-byte, and streams the response back via `Body::from_stream` —
//! a plain reverse proxy rather than a provider-aware one.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use super::registry::BackendRegistry;

pub struct BalancerState {
    pub registry: Arc<BackendRegistry>,
    pub http: reqwest::Client,
}

/// `x-forwarded-for` first hop, else `x-real-ip`, else the socket peer
/// address passed in by the caller.
pub fn client_ip(headers: &HeaderMap, peer: &str) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !real_ip.trim().is_empty() {
            return real_ip.trim().to_string();
        }
    }
    peer.to_string()
}

/// Sticky-cache hit wins; otherwise `md5(clientIP)`'s first 32 bits modulo
/// the healthy-backend count, cached for next time. Falls back to
/// `backends[0]` when nothing is healthy.
pub fn select_backend(registry: &BackendRegistry, client_ip: &str) -> Option<usize> {
    if let Some(cached) = registry.cached_backend_index(client_ip) {
        return Some(cached);
    }

    let healthy = registry.healthy_indices();
    if healthy.is_empty() {
        return if registry.is_empty() { None } else { Some(0) };
    }

    let digest = md5::compute(client_ip.as_bytes());
    let hash_val = u32::from_be_bytes(digest.0[0..4].try_into().unwrap());
    let chosen = healthy[(hash_val as usize) % healthy.len()];
    registry.cache_mapping(client_ip, chosen);
    Some(chosen)
}

/// Forwards the inbound request to the selected backend, byte-for-byte. On
/// connection error, marks that backend unhealthy and retries once against
/// the next healthy backend; returns
/// `BadGateway` if none remain.
pub async fn proxy(
    State(state): State<Arc<BalancerState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ip = client_ip(&headers, &peer.ip().to_string());
    let Some(mut index) = select_backend(&state.registry, &ip) else {
        return StatusCode::BAD_GATEWAY.into_response();
    };

    let mut attempted = std::collections::HashSet::new();
    loop {
        attempted.insert(index);
        let backend = {
            let backends = state.registry.snapshot();
            match backends.get(index) {
                Some(b) => b.clone(),
                None => return StatusCode::BAD_GATEWAY.into_response(),
            }
        };

        let url = format!("http://{}{}", backend.addr(), uri.path_and_query().map(|p| p.as_str()).unwrap_or("/"));
        let mut request = state.http.request(method.clone(), &url).body(body.clone());
        for (name, value) in headers.iter() {
            if *name == axum::http::header::HOST {
                continue;
            }
            request = request.header(name, value);
        }

        match request.send().await {
            Ok(resp) => {
                let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
                let mut response_headers = HeaderMap::new();
                for (name, value) in resp.headers() {
                    response_headers.insert(name, value.clone());
                }
                let byte_stream = resp.bytes_stream();
                let mut builder = Response::builder().status(status);
                if let Some(h) = builder.headers_mut() {
                    *h = response_headers;
                }
                return builder
                    .body(Body::from_stream(byte_stream))
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
            }
            Err(e) => {
                tracing::warn!(backend = %backend.addr(), error = %e, "backend connection failed, marking unhealthy");
                state.registry.set_healthy(index, false);
                let healthy = state.registry.healthy_indices();
                match healthy.into_iter().find(|i| !attempted.contains(i)) {
                    Some(next) => index = next,
                    None => return StatusCode::BAD_GATEWAY.into_response(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::registry::Backend;

    fn registry(n: usize) -> BackendRegistry {
        BackendRegistry::new((0..n).map(backend_at).collect())
    }

    fn backend_at(i: usize) -> Backend {
        Backend { host: "127.0.0.1".into(), port: 9000 + i as u16, healthy: true, last_check: None, last_latency_ms: None }
    }

    #[test]
    fn client_ip_prefers_x_forwarded_for_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.0.0.1, 10.0.0.2".parse().unwrap());
        assert_eq!(client_ip(&headers, "unknown"), "10.0.0.1");
    }

    #[test]
    fn client_ip_falls_back_to_real_ip_then_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "10.0.0.9".parse().unwrap());
        assert_eq!(client_ip(&headers, "unknown"), "10.0.0.9");
        assert_eq!(client_ip(&HeaderMap::new(), "10.0.0.5"), "10.0.0.5");
    }

    #[test]
    fn select_backend_is_deterministic_for_same_ip() {
        let reg = registry(4);
        let first = select_backend(&reg, "1.2.3.4").unwrap();
        let second = select_backend(&reg, "1.2.3.4").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn select_backend_falls_back_to_first_when_none_healthy() {
        let reg = registry(2);
        reg.set_healthy(0, false);
        reg.set_healthy(1, false);
        assert_eq!(select_backend(&reg, "1.2.3.4"), Some(0));
    }

    #[test]
    fn select_backend_skips_unhealthy_backends() {
        let reg = registry(2);
        reg.set_healthy(1, false);
        for ip in ["a", "b", "c", "d", "e"] {
            assert_eq!(select_backend(&reg, ip), Some(0));
        }
    }
}
