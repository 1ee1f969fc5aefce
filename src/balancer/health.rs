//! Background loops for the balancer: active health probing, DNS
//! re-resolution, and IP-mapping GC. Each runs an initial startup delay,
//! then a `loop { ...; sleep }`.

use std::sync::Arc;
use std::time::Duration;

use crate::config::BackendDiscovery;

use super::registry::{resolve, BackendRegistry};

const PROBE_INTERVAL: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const STARTUP_PROBE_DELAY: Duration = Duration::from_secs(5);
const DNS_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const GC_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// `GET /health` against every backend every 30s with a 3s timeout; flips
/// `healthy` on the result. An initial one-shot probe runs after 5s so
/// freshly started backends aren't routed to before they're ready.
pub async fn probe_loop(registry: Arc<BackendRegistry>, http: reqwest::Client) {
    tokio::time::sleep(STARTUP_PROBE_DELAY).await;
    loop {
        probe_once(&registry, &http).await;
        tokio::time::sleep(PROBE_INTERVAL).await;
    }
}

async fn probe_once(registry: &BackendRegistry, http: &reqwest::Client) {
    let backends = registry.snapshot();
    for (index, backend) in backends.iter().enumerate() {
        let url = format!("http://{}/health", backend.addr());
        let started = std::time::Instant::now();
        let healthy = http
            .get(&url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map(|resp| resp.status().is_success())
            .unwrap_or(false);
        let latency_ms = healthy.then(|| started.elapsed().as_millis() as u64);
        if healthy != backend.healthy {
            tracing::info!(backend = %backend.addr(), healthy, "backend health changed");
        }
        registry.set_health_result(index, healthy, latency_ms);
    }
}

/// Re-resolves DNS backends every 60s; [`BackendRegistry::replace`] clears
/// the IP mapping cache itself when the backend count changes. A no-op for
/// non-DNS discovery modes.
pub async fn dns_refresh_loop(registry: Arc<BackendRegistry>, discovery: BackendDiscovery) {
    if !matches!(discovery, BackendDiscovery::Dns { .. }) {
        return;
    }
    loop {
        tokio::time::sleep(DNS_REFRESH_INTERVAL).await;
        let backends = resolve(&discovery).await;
        if backends.is_empty() {
            tracing::warn!("DNS re-resolution returned no backends, keeping previous list");
            continue;
        }
        registry.replace(backends);
    }
}

pub async fn ip_mapping_gc_loop(registry: Arc<BackendRegistry>) {
    loop {
        tokio::time::sleep(GC_INTERVAL).await;
        registry.gc_ip_mapping();
    }
}
