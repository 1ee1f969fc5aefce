//! Single-instance sweeper loops: token-refresh, quota-refresh, and
//! log-retention. Each is guarded against overlap by construction — a
//! sequential `loop { sweep().await; sleep().await }` never starts a new
//! sweep before the previous one finished. A brief startup delay lets the
//! rest of the gateway finish booting before the first sweep runs.

use std::sync::Arc;

use crate::credentials::CredentialRegistry;
use crate::health::HealthTracker;
use crate::settings::SettingsStore;
use crate::store::{Provider, Store};
use crate::token::TokenManager;

const STARTUP_DELAY: std::time::Duration = std::time::Duration::from_secs(10);

/// Spawns all three sweepers as detached tasks. Returns immediately; the
/// tasks run for the lifetime of the process.
pub fn spawn_all(
    store: Arc<dyn Store>,
    registry: Arc<CredentialRegistry>,
    settings: Arc<SettingsStore>,
    token_manager: Arc<TokenManager>,
    health: Arc<HealthTracker>,
) {
    tokio::spawn(token_refresh_loop(Arc::clone(&registry), Arc::clone(&settings), Arc::clone(&token_manager), Arc::clone(&health)));
    tokio::spawn(quota_refresh_loop(Arc::clone(&registry), Arc::clone(&settings)));
    tokio::spawn(log_retention_loop(store, settings));
}

/// Refreshes any credential whose `expiresAt - now <= tokenRefreshThreshold`
/// across every provider.
async fn token_refresh_loop(
    registry: Arc<CredentialRegistry>,
    settings: Arc<SettingsStore>,
    token_manager: Arc<TokenManager>,
    health: Arc<HealthTracker>,
) {
    tokio::time::sleep(STARTUP_DELAY).await;
    loop {
        let global = settings.get().await;
        for provider in Provider::ALL {
            let credentials = match registry.list_active(provider).await {
                Ok(list) => list,
                Err(e) => {
                    tracing::warn!(%provider, error = %e, "token sweep: failed to list credentials");
                    continue;
                }
            };
            for mut credential in credentials {
                if !TokenManager::is_expiring_soon(credential.expiry, global.token_refresh_threshold_minutes) {
                    continue;
                }
                match token_manager.refresh(&credential).await {
                    Ok(outcome) => {
                        credential.access_secret = outcome.access_secret;
                        if outcome.refresh_secret.is_some() {
                            credential.refresh_secret = outcome.refresh_secret;
                        }
                        credential.expiry = outcome.expiry;
                        if let Err(e) = registry.update(credential.clone()).await {
                            tracing::warn!(%provider, id = %credential.id, error = %e, "token sweep: failed to persist refreshed credential");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(%provider, id = %credential.id, error = %e, "token sweep: refresh failed");
                        let _ = health.record_failure(provider, &credential.id, global.health_failure_penalty, &e.to_string()).await;
                    }
                }
            }
        }
        tokio::time::sleep(std::time::Duration::from_secs(global.token_refresh_sweep_interval_secs)).await;
    }
}

/// Stamps `quota_fetched_at` fresh for any credential whose cached quota
/// has gone stale. No per-provider quota API is wired up in this build —
/// see DESIGN.md — so this sweeper only enforces the freshness window the
/// selection engine reads, rather than calling out to an upstream quota
/// endpoint.
async fn quota_refresh_loop(registry: Arc<CredentialRegistry>, settings: Arc<SettingsStore>) {
    tokio::time::sleep(STARTUP_DELAY).await;
    loop {
        let global = settings.get().await;
        for provider in Provider::ALL {
            let credentials = match registry.list(provider).await {
                Ok(list) => list,
                Err(e) => {
                    tracing::warn!(%provider, error = %e, "quota sweep: failed to list credentials");
                    continue;
                }
            };
            for credential in credentials {
                if credential.is_quota_fresh(global.quota_ttl_secs) {
                    continue;
                }
                if let Err(e) = registry.update_quota(provider, &credential.id, credential.quota.clone()).await {
                    tracing::warn!(%provider, id = %credential.id, error = %e, "quota sweep: failed to refresh quota timestamp");
                }
            }
        }
        tokio::time::sleep(std::time::Duration::from_secs(global.quota_refresh_sweep_interval_secs)).await;
    }
}

/// Deletes `ApiLog` rows older than the retention window, daily.
async fn log_retention_loop(store: Arc<dyn Store>, settings: Arc<SettingsStore>) {
    tokio::time::sleep(STARTUP_DELAY).await;
    loop {
        let global = settings.get().await;
        let cutoff = chrono::Utc::now() - chrono::Duration::days(global.log_retention_days);
        match store.delete_logs_older_than(cutoff).await {
            Ok(deleted) => {
                if deleted > 0 {
                    tracing::info!(deleted, %cutoff, "log retention sweep complete");
                }
            }
            Err(e) => tracing::warn!(error = %e, "log retention sweep failed"),
        }
        tokio::time::sleep(std::time::Duration::from_secs(global.log_retention_sweep_interval_secs)).await;
    }
}
