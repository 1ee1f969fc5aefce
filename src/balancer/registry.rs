//! Backend list and the client-IP sticky mapping cache.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tokio::net::lookup_host;

use crate::config::BackendDiscovery;

const IP_MAPPING_TTL: Duration = Duration::from_secs(60 * 60);

/// One gateway instance the balancer fronts.
#[derive(Debug, Clone)]
pub struct Backend {
    pub host: String,
    pub port: u16,
    pub healthy: bool,
    pub last_check: Option<Instant>,
    pub last_latency_ms: Option<u64>,
}

impl Backend {
    fn new(host: String, port: u16) -> Self {
        Self { host, port, healthy: true, last_check: None, last_latency_ms: None }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Copy)]
struct CachedMapping {
    backend_index: usize,
    cached_at: Instant,
}

/// Resolves the configured [`BackendDiscovery`] mode into a concrete list,
/// once at startup and again each time [`BackendRegistry::refresh_dns`] is
/// called by the re-resolution loop.
pub async fn resolve(discovery: &BackendDiscovery) -> Vec<Backend> {
    match discovery {
        BackendDiscovery::Explicit(hosts) => hosts
            .iter()
            .filter_map(|entry| {
                let (host, port) = entry.rsplit_once(':')?;
                let port: u16 = port.parse().ok()?;
                Some(Backend::new(host.to_string(), port))
            })
            .collect(),
        BackendDiscovery::Dns { hostname, port } => {
            let lookup_target = format!("{hostname}:{port}");
            match lookup_host(&lookup_target).await {
                Ok(addrs) => addrs.map(|a| Backend::new(a.ip().to_string(), *port)).collect(),
                Err(e) => {
                    tracing::warn!(hostname = %hostname, error = %e, "DNS resolution failed");
                    Vec::new()
                }
            }
        }
        BackendDiscovery::LocalRange { start_port, count } => (0..*count)
            .map(|i| Backend::new("127.0.0.1".to_string(), start_port + i))
            .collect(),
    }
}

/// Holds the backend list and the client-IP -> backend-index sticky cache.
/// `backends` and `ip_mapping` are each guarded by their own lock since the
/// hot path (selection) only ever needs one or the other at a time.
pub struct BackendRegistry {
    backends: RwLock<Vec<Backend>>,
    ip_mapping: RwLock<HashMap<String, CachedMapping>>,
}

impl BackendRegistry {
    pub fn new(backends: Vec<Backend>) -> Self {
        Self {
            backends: RwLock::new(backends),
            ip_mapping: RwLock::new(HashMap::new()),
        }
    }

    pub fn snapshot(&self) -> Vec<Backend> {
        self.backends.read().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.backends.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_healthy(&self, index: usize, healthy: bool) {
        self.set_health_result(index, healthy, None);
    }

    pub fn set_health_result(&self, index: usize, healthy: bool, latency_ms: Option<u64>) {
        let mut backends = self.backends.write().unwrap();
        if let Some(backend) = backends.get_mut(index) {
            backend.healthy = healthy;
            backend.last_check = Some(Instant::now());
            backend.last_latency_ms = latency_ms;
        }
    }

    pub fn healthy_indices(&self) -> Vec<usize> {
        self.backends
            .read()
            .unwrap()
            .iter()
            .enumerate()
            .filter(|(_, b)| b.healthy)
            .map(|(i, _)| i)
            .collect()
    }

    /// Replaces the backend list wholesale (DNS re-resolution on count
    /// change) and clears the IP mapping cache, since cached indices would
    /// otherwise point at the wrong entries.
    pub fn replace(&self, backends: Vec<Backend>) {
        let changed = {
            let current = self.backends.read().unwrap();
            current.len() != backends.len()
        };
        *self.backends.write().unwrap() = backends;
        if changed {
            self.ip_mapping.write().unwrap().clear();
        }
    }

    pub fn cached_backend_index(&self, client_ip: &str) -> Option<usize> {
        let mapping = self.ip_mapping.read().unwrap();
        let entry = mapping.get(client_ip)?;
        if entry.cached_at.elapsed() > IP_MAPPING_TTL {
            return None;
        }
        let backends = self.backends.read().unwrap();
        let backend = backends.get(entry.backend_index)?;
        if backend.healthy {
            Some(entry.backend_index)
        } else {
            None
        }
    }

    pub fn cache_mapping(&self, client_ip: &str, backend_index: usize) {
        self.ip_mapping.write().unwrap().insert(
            client_ip.to_string(),
            CachedMapping { backend_index, cached_at: Instant::now() },
        );
    }

    /// Drops entries whose TTL has elapsed.
    pub fn gc_ip_mapping(&self) {
        let mut mapping = self.ip_mapping.write().unwrap();
        mapping.retain(|_, entry| entry.cached_at.elapsed() <= IP_MAPPING_TTL);
    }

    #[cfg(test)]
    pub fn ip_mapping_len(&self) -> usize {
        self.ip_mapping.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(n: usize) -> BackendRegistry {
        BackendRegistry::new((0..n).map(|i| Backend::new("127.0.0.1".into(), 9000 + i as u16)).collect())
    }

    #[test]
    fn cached_mapping_expires_after_ttl() {
        let reg = registry(2);
        reg.cache_mapping("1.2.3.4", 0);
        assert_eq!(reg.cached_backend_index("1.2.3.4"), Some(0));
    }

    #[test]
    fn cached_mapping_to_unhealthy_backend_is_not_returned() {
        let reg = registry(2);
        reg.cache_mapping("1.2.3.4", 1);
        reg.set_healthy(1, false);
        assert_eq!(reg.cached_backend_index("1.2.3.4"), None);
    }

    #[test]
    fn replace_with_same_length_keeps_mapping_cache() {
        let reg = registry(2);
        reg.cache_mapping("1.2.3.4", 0);
        reg.replace((0..2).map(|i| Backend::new("10.0.0.1".into(), 9100 + i as u16)).collect());
        assert_eq!(reg.ip_mapping_len(), 1);
    }

    #[test]
    fn replace_with_different_length_clears_mapping_cache() {
        let reg = registry(2);
        reg.cache_mapping("1.2.3.4", 0);
        reg.replace((0..3).map(|i| Backend::new("10.0.0.1".into(), 9100 + i as u16)).collect());
        assert_eq!(reg.ip_mapping_len(), 0);
    }

    #[test]
    fn healthy_indices_excludes_unhealthy_backends() {
        let reg = registry(3);
        reg.set_healthy(1, false);
        assert_eq!(reg.healthy_indices(), vec![0, 2]);
    }
}
