//! Selection engine: picks a healthy credential for a provider pool.
//!
//! Candidates are filtered against the active-health-quarantine
//! thresholds, relaxed in stages if nothing survives, scored by a hybrid
//! formula, and tiebroken on a secondary key; round-robin selection keeps
//! its own rotating index cursor per pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::settings::{SelectionConfig, SettingsStore, Strategy};
use crate::store::{Credential, Provider, Store};

#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("no healthy credential available for provider {0}")]
    Unavailable(Provider),
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
}

pub type SelectionResult<T> = Result<T, SelectionError>;

pub struct SelectionEngine {
    store: Arc<dyn Store>,
    settings: Arc<SettingsStore>,
    round_robin_cursors: std::sync::Mutex<HashMap<Provider, Arc<AtomicU64>>>,
}

impl SelectionEngine {
    pub fn new(store: Arc<dyn Store>, settings: Arc<SettingsStore>) -> Self {
        Self {
            store,
            settings,
            round_robin_cursors: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// `model` narrows the per-model quota signal used by the hybrid score;
    /// pass `None` when the caller has no specific model yet.
    pub async fn select(
        &self,
        provider: Provider,
        fingerprint: &str,
        model: Option<&str>,
    ) -> SelectionResult<Credential> {
        let config = self.settings.selection_config(provider.as_str()).await;
        let global = self.settings.get().await;

        let mut candidates = self.store.list_active_credentials(provider).await?;
        candidates.retain(|c| c.error_count < config.quarantine_threshold);

        if provider == Provider::Gemini {
            candidates.retain(|c| c.aux.project_id.is_some());
        }

        if candidates.is_empty() {
            return Err(SelectionError::Unavailable(provider));
        }

        let mut healthy = Vec::with_capacity(candidates.len());
        for c in &candidates {
            let health = self.store.get_health(provider, &c.id).await?;
            if health.score >= config.min_health_threshold {
                healthy.push(c.clone());
            }
        }
        // Relax to the full active set if the health filter leaves nothing.
        let pool = if healthy.is_empty() { candidates.clone() } else { healthy };

        let chosen = match config.strategy {
            Strategy::Hybrid => {
                self.select_hybrid(provider, &pool, &config, model, global.quota_ttl_secs)
                    .await?
            }
            Strategy::Sticky => {
                self.select_sticky(provider, &candidates, &pool, fingerprint, &config, model, global.quota_ttl_secs)
                    .await?
            }
            Strategy::RoundRobin => self.select_round_robin(provider, &pool),
        };

        chosen.ok_or(SelectionError::Unavailable(provider))
    }

    async fn score(
        &self,
        provider: Provider,
        credential: &Credential,
        config: &SelectionConfig,
        model: Option<&str>,
        quota_ttl_secs: i64,
    ) -> SelectionResult<f64> {
        let health = self.store.get_health(provider, &credential.id).await?;
        let bucket = self.store.get_bucket(provider, &credential.id).await?;
        let effective_tokens =
            crate::health::HealthTracker::effective_tokens(&bucket, config.token_bucket_max, config.token_regen_per_minute);

        let quota_signal = self.quota_signal(credential, config, model, quota_ttl_secs);

        let recency_boost = match credential.last_used_at {
            Some(last_used) => {
                let elapsed_ms = (chrono::Utc::now() - last_used).num_milliseconds().max(0) as f64;
                1.0 - (elapsed_ms / config.recency_window_ms as f64).min(1.0)
            }
            None => 0.0,
        };

        Ok(config.health_weight * (health.score / 100.0)
            + config.token_weight * (effective_tokens / config.token_bucket_max)
            + config.quota_weight * quota_signal
            + config.lru_weight * recency_boost)
    }

    fn quota_signal(
        &self,
        credential: &Credential,
        config: &SelectionConfig,
        model: Option<&str>,
        quota_ttl_secs: i64,
    ) -> f64 {
        if !credential.is_quota_fresh(quota_ttl_secs) {
            return 0.5;
        }
        let Some(model) = model else { return 0.5 };
        let Some(entry) = credential.quota.get(model) else {
            return 0.5;
        };
        if entry.remaining_fraction >= config.quota_low_threshold {
            1.0
        } else if entry.remaining_fraction >= config.quota_critical_threshold {
            0.3
        } else {
            0.05
        }
    }

    async fn select_hybrid(
        &self,
        provider: Provider,
        pool: &[Credential],
        config: &SelectionConfig,
        model: Option<&str>,
        quota_ttl_secs: i64,
    ) -> SelectionResult<Option<Credential>> {
        let mut best: Option<(Credential, f64)> = None;
        for c in pool {
            let s = self.score(provider, c, config, model, quota_ttl_secs).await?;
            best = match best {
                None => Some((c.clone(), s)),
                Some((ref current, current_score)) => {
                    if s > current_score
                        || (s == current_score && is_better_tiebreak(c, current))
                    {
                        Some((c.clone(), s))
                    } else {
                        best
                    }
                }
            };
        }
        Ok(best.map(|(c, _)| c))
    }

    /// Hashes into `candidates` — the active/quarantine-filtered set, not
    /// the health-reduced `pool` — so a fixed fingerprint keeps mapping to
    /// the same credential regardless of other credentials' health moving
    /// in and out of `pool`. Falls back to hybrid selection over `pool`
    /// only when the hashed pick itself is currently below the health
    /// threshold.
    async fn select_sticky(
        &self,
        provider: Provider,
        candidates: &[Credential],
        pool: &[Credential],
        fingerprint: &str,
        config: &SelectionConfig,
        model: Option<&str>,
        quota_ttl_secs: i64,
    ) -> SelectionResult<Option<Credential>> {
        let Some(candidate) = hash_into(candidates, fingerprint) else {
            return Ok(None);
        };
        let health = self.store.get_health(provider, &candidate.id).await?;
        if health.score >= config.min_health_threshold {
            return Ok(Some(candidate));
        }
        self.select_hybrid(provider, pool, config, model, quota_ttl_secs).await
    }

    fn select_round_robin(&self, provider: Provider, pool: &[Credential]) -> Option<Credential> {
        if pool.is_empty() {
            return None;
        }
        let cursor = {
            let mut cursors = self.round_robin_cursors.lock().unwrap();
            cursors
                .entry(provider)
                .or_insert_with(|| Arc::new(AtomicU64::new(0)))
                .clone()
        };
        let next = cursor.fetch_add(1, Ordering::Relaxed);
        let idx = (next as usize) % pool.len();
        Some(pool[idx].clone())
    }
}

/// `md5(fingerprint)`'s first 64 bits modulo `candidates.len()`.
fn hash_into(candidates: &[Credential], fingerprint: &str) -> Option<Credential> {
    if candidates.is_empty() {
        return None;
    }
    let digest = md5::compute(fingerprint.as_bytes());
    let hash_val = u64::from_be_bytes(digest.0[0..8].try_into().unwrap());
    let idx = (hash_val as usize) % candidates.len();
    Some(candidates[idx].clone())
}

/// Tiebreak: lower `errorCount`, then lower `lastUsedAt`.
fn is_better_tiebreak(candidate: &Credential, current: &Credential) -> bool {
    if candidate.error_count != current.error_count {
        return candidate.error_count < current.error_count;
    }
    match (candidate.last_used_at, current.last_used_at) {
        (Some(a), Some(b)) => a < b,
        (None, Some(_)) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{GlobalSettings, SettingsStore};
    use crate::store::memory::MemoryStore;
    use crate::store::AuxAuthFields;
    use chrono::Utc;
    use std::collections::HashMap;

    fn sample(id: &str, provider: Provider) -> Credential {
        let now = Utc::now();
        Credential {
            id: id.to_string(),
            provider,
            display_name: id.to_string(),
            access_secret: "s".into(),
            refresh_secret: None,
            aux: AuxAuthFields::default(),
            expiry: None,
            active: true,
            use_count: 0,
            last_used_at: None,
            error_count: 0,
            last_error_message: None,
            last_error_at: None,
            quota: HashMap::new(),
            quota_fetched_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    async fn engine() -> (SelectionEngine, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new().await.unwrap());
        let settings = Arc::new(SettingsStore::new(store.clone()));
        (SelectionEngine::new(store.clone(), settings), store)
    }

    #[tokio::test]
    async fn returns_unavailable_when_no_active_credentials() {
        let (engine, _store) = engine().await;
        let err = engine.select(Provider::Kiro, "fp", None).await.unwrap_err();
        assert!(matches!(err, SelectionError::Unavailable(Provider::Kiro)));
    }

    #[tokio::test]
    async fn hybrid_picks_the_only_candidate() {
        let (engine, store) = engine().await;
        store.insert_credential(sample("only", Provider::Kiro)).await.unwrap();
        let picked = engine.select(Provider::Kiro, "fp", None).await.unwrap();
        assert_eq!(picked.id, "only");
    }

    #[tokio::test]
    async fn round_robin_cycles_through_pool() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new().await.unwrap());
        store.insert_credential(sample("a", Provider::Kiro)).await.unwrap();
        store.insert_credential(sample("b", Provider::Kiro)).await.unwrap();
        let mut settings = GlobalSettings::default();
        settings
            .per_provider
            .insert("kiro".to_string(), crate::settings::SelectionConfig {
                strategy: Strategy::RoundRobin,
                ..Default::default()
            });
        let settings_store = Arc::new(SettingsStore::new(store.clone()));
        settings_store.update(settings).await.unwrap();
        let engine = SelectionEngine::new(store, settings_store);

        let first = engine.select(Provider::Kiro, "fp", None).await.unwrap();
        let second = engine.select(Provider::Kiro, "fp", None).await.unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn sticky_pick_is_stable_when_an_unrelated_credential_loses_health() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new().await.unwrap());
        for id in ["a", "b", "c"] {
            store.insert_credential(sample(id, Provider::Kiro)).await.unwrap();
        }
        let mut settings = GlobalSettings::default();
        settings.per_provider.insert(
            "kiro".to_string(),
            crate::settings::SelectionConfig { strategy: Strategy::Sticky, ..Default::default() },
        );
        let settings_store = Arc::new(SettingsStore::new(store.clone()));
        settings_store.update(settings).await.unwrap();
        let engine = SelectionEngine::new(store.clone(), settings_store);

        let before = engine.select(Provider::Kiro, "same-fingerprint", None).await.unwrap();

        // An unrelated credential's health drops out of the healthy pool;
        // the sticky pick (not itself unhealthy) must not change.
        for id in ["a", "b", "c"] {
            if id != before.id {
                store
                    .upsert_health(crate::store::Health {
                        provider: Provider::Kiro,
                        credential_id: id.to_string(),
                        score: 0.0,
                        consecutive_failures: 5,
                        last_success_at: None,
                        last_failure_at: None,
                        last_error_message: None,
                    })
                    .await
                    .unwrap();
                break;
            }
        }

        let after = engine.select(Provider::Kiro, "same-fingerprint", None).await.unwrap();
        assert_eq!(before.id, after.id);
    }

    #[tokio::test]
    async fn unhealthy_pool_relaxes_to_full_active_set() {
        let (engine, store) = engine().await;
        store.insert_credential(sample("low-health", Provider::Kiro)).await.unwrap();
        store
            .upsert_health(crate::store::Health {
                provider: Provider::Kiro,
                credential_id: "low-health".to_string(),
                score: 0.0,
                consecutive_failures: 5,
                last_success_at: None,
                last_failure_at: None,
                last_error_message: None,
            })
            .await
            .unwrap();
        let picked = engine.select(Provider::Kiro, "fp", None).await.unwrap();
        assert_eq!(picked.id, "low-health");
    }
}
