//! Runtime-tunable policy settings.
//!
//! Selection weights, refresh intervals, and per-provider strategy must be
//! readable at request time without a store round-trip on every request, so
//! the latest settings row is cached in-process (`Arc<RwLock<Settings>>`)
//! with a short TTL and invalidated on admin update.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::store::{Provider, Store};

/// Selection strategy for a provider pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    Hybrid,
    Sticky,
    RoundRobin,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::Hybrid
    }
}

/// Per-provider selection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    pub strategy: Strategy,
    pub health_weight: f64,
    pub token_weight: f64,
    pub quota_weight: f64,
    pub lru_weight: f64,
    pub min_health_threshold: f64,
    pub token_bucket_max: f64,
    pub token_regen_per_minute: f64,
    pub quota_low_threshold: f64,
    pub quota_critical_threshold: f64,
    /// Window (ms) used to normalize recency boost in the hybrid formula.
    pub recency_window_ms: i64,
    /// `errorCount` at which a credential becomes eligible for quarantine.
    pub quarantine_threshold: u32,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Hybrid,
            health_weight: 0.4,
            token_weight: 0.3,
            quota_weight: 0.2,
            lru_weight: 0.1,
            min_health_threshold: 20.0,
            token_bucket_max: 50.0,
            token_regen_per_minute: 6.0,
            quota_low_threshold: 0.2,
            quota_critical_threshold: 0.05,
            recency_window_ms: 5 * 60 * 1000,
            quarantine_threshold: 5,
        }
    }
}

/// Global background-loop intervals and other cross-cutting policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSettings {
    pub token_refresh_threshold_minutes: i64,
    pub token_refresh_sweep_interval_secs: u64,
    pub quota_ttl_secs: i64,
    pub quota_refresh_sweep_interval_secs: u64,
    pub log_retention_days: i64,
    pub log_retention_sweep_interval_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_secs: f64,
    pub health_success_bonus: f64,
    pub health_failure_penalty: f64,
    pub health_rate_limit_penalty: f64,
    #[serde(default)]
    pub per_provider: HashMap<String, SelectionConfig>,
    /// Explicit `model -> provider` routing overrides,
    /// consulted before the `ModelAlias` table and the provider-name
    /// heuristic. Keyed on the client-facing model name as given in the
    /// request, not the resolved upstream model id.
    #[serde(default)]
    pub model_routing: HashMap<String, Provider>,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            token_refresh_threshold_minutes: 10,
            token_refresh_sweep_interval_secs: 30 * 60,
            quota_ttl_secs: 5 * 60,
            quota_refresh_sweep_interval_secs: 5 * 60,
            log_retention_days: 30,
            log_retention_sweep_interval_secs: 24 * 60 * 60,
            max_retries: 3,
            retry_base_delay_secs: 1.0,
            health_success_bonus: 1.0,
            health_failure_penalty: 20.0,
            health_rate_limit_penalty: 10.0,
            per_provider: HashMap::new(),
            model_routing: HashMap::new(),
        }
    }
}

/// TTL applied to the in-process settings cache before a store re-read.
const SETTINGS_CACHE_TTL: Duration = Duration::from_secs(60);

struct CachedSettings {
    value: GlobalSettings,
    fetched_at: Instant,
}

/// In-process, TTL-cached view over the persisted settings row.
pub struct SettingsStore {
    store: Arc<dyn Store>,
    cached: RwLock<Option<CachedSettings>>,
}

impl SettingsStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            cached: RwLock::new(None),
        }
    }

    /// Read the current settings, refreshing from the store if the cache is
    /// stale or empty.
    pub async fn get(&self) -> GlobalSettings {
        {
            let guard = self.cached.read().await;
            if let Some(cached) = guard.as_ref() {
                if cached.fetched_at.elapsed() < SETTINGS_CACHE_TTL {
                    return cached.value.clone();
                }
            }
        }
        self.refresh().await
    }

    /// Per-provider selection config, falling back to the default when unset.
    pub async fn selection_config(&self, provider: &str) -> SelectionConfig {
        let settings = self.get().await;
        settings
            .per_provider
            .get(provider)
            .cloned()
            .unwrap_or_default()
    }

    async fn refresh(&self) -> GlobalSettings {
        let loaded = self
            .store
            .load_settings()
            .await
            .unwrap_or_default()
            .unwrap_or_default();
        let mut guard = self.cached.write().await;
        *guard = Some(CachedSettings {
            value: loaded.clone(),
            fetched_at: Instant::now(),
        });
        loaded
    }

    /// Persist new settings and invalidate the cache immediately so the next
    /// request observes the update without waiting out the TTL.
    pub async fn update(&self, settings: GlobalSettings) -> anyhow::Result<()> {
        self.store.save_settings(&settings).await?;
        let mut guard = self.cached.write().await;
        *guard = Some(CachedSettings {
            value: settings,
            fetched_at: Instant::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn default_settings_round_trip() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new().await.unwrap());
        let settings = SettingsStore::new(store);
        let loaded = settings.get().await;
        assert_eq!(loaded.max_retries, 3);
    }

    #[tokio::test]
    async fn update_invalidates_cache_immediately() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new().await.unwrap());
        let settings = SettingsStore::new(store);
        let mut updated = settings.get().await;
        updated.max_retries = 7;
        settings.update(updated).await.unwrap();
        assert_eq!(settings.get().await.max_retries, 7);
    }
}
