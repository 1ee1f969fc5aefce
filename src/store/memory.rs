//! In-memory store backend, used by tests and as a fallback when no MySQL
//! connection is configured.
//!
//! One `Arc<RwLock<HashMap<...>>>` per entity; nothing is persisted across
//! process restarts.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    ApiKey, ApiLog, Credential, ErrorCredential, Health, ModelAlias, ModelPricing, Provider,
    QuotaEntry, Store, StoreError, StoreResult, ThinkingSignatureEntry, TokenBucket, UsageCounters,
};
use crate::settings::GlobalSettings;

#[derive(Default)]
pub struct MemoryStore {
    credentials: RwLock<HashMap<(Provider, String), Credential>>,
    error_credentials: RwLock<HashMap<(Provider, String), ErrorCredential>>,
    health: RwLock<HashMap<(Provider, String), Health>>,
    buckets: RwLock<HashMap<(Provider, String), TokenBucket>>,
    api_keys: RwLock<HashMap<String, ApiKey>>,
    api_logs: RwLock<Vec<ApiLog>>,
    thinking_cache: RwLock<HashMap<String, ThinkingSignatureEntry>>,
    model_aliases: RwLock<Vec<ModelAlias>>,
    model_pricing: RwLock<HashMap<String, ModelPricing>>,
    settings: RwLock<Option<GlobalSettings>>,
    error_seq: RwLock<u64>,
}

impl MemoryStore {
    pub async fn new() -> anyhow::Result<Self> {
        Ok(Self::default())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_credential(&self, credential: Credential) -> StoreResult<()> {
        let key = (credential.provider, credential.id.clone());
        let mut map = self.credentials.write().await;
        if map.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "credential {} already exists for {}",
                credential.id, credential.provider
            )));
        }
        map.insert(key, credential);
        Ok(())
    }

    async fn update_credential(&self, credential: Credential) -> StoreResult<()> {
        let key = (credential.provider, credential.id.clone());
        let mut map = self.credentials.write().await;
        map.insert(key, credential);
        Ok(())
    }

    async fn delete_credential(&self, provider: Provider, id: &str) -> StoreResult<()> {
        self.credentials
            .write()
            .await
            .remove(&(provider, id.to_string()))
            .ok_or(StoreError::NotFound)?;
        Ok(())
    }

    async fn find_credential(&self, provider: Provider, id: &str) -> StoreResult<Credential> {
        self.credentials
            .read()
            .await
            .get(&(provider, id.to_string()))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn find_credential_by_name(
        &self,
        provider: Provider,
        name: &str,
    ) -> StoreResult<Credential> {
        self.credentials
            .read()
            .await
            .values()
            .find(|c| c.provider == provider && c.display_name == name)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn list_credentials(&self, provider: Provider) -> StoreResult<Vec<Credential>> {
        let mut out: Vec<Credential> = self
            .credentials
            .read()
            .await
            .values()
            .filter(|c| c.provider == provider)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.error_count
                .cmp(&b.error_count)
                .then(b.updated_at.cmp(&a.updated_at))
        });
        Ok(out)
    }

    async fn list_active_credentials(&self, provider: Provider) -> StoreResult<Vec<Credential>> {
        Ok(self
            .list_credentials(provider)
            .await?
            .into_iter()
            .filter(|c| c.active)
            .collect())
    }

    async fn increment_use_count(&self, provider: Provider, id: &str) -> StoreResult<()> {
        let mut map = self.credentials.write().await;
        let cred = map
            .get_mut(&(provider, id.to_string()))
            .ok_or(StoreError::NotFound)?;
        cred.use_count += 1;
        cred.last_used_at = Some(Utc::now());
        cred.updated_at = Utc::now();
        Ok(())
    }

    async fn record_error_count(
        &self,
        provider: Provider,
        id: &str,
        message: &str,
    ) -> StoreResult<u32> {
        let mut map = self.credentials.write().await;
        let cred = map
            .get_mut(&(provider, id.to_string()))
            .ok_or(StoreError::NotFound)?;
        cred.error_count += 1;
        cred.last_error_message = Some(message.to_string());
        cred.last_error_at = Some(Utc::now());
        cred.updated_at = Utc::now();
        Ok(cred.error_count)
    }

    async fn reset_error_count(&self, provider: Provider, id: &str) -> StoreResult<()> {
        let mut map = self.credentials.write().await;
        let cred = map
            .get_mut(&(provider, id.to_string()))
            .ok_or(StoreError::NotFound)?;
        cred.error_count = 0;
        cred.last_error_message = None;
        cred.updated_at = Utc::now();
        Ok(())
    }

    async fn update_quota(
        &self,
        provider: Provider,
        id: &str,
        quota: HashMap<String, QuotaEntry>,
    ) -> StoreResult<()> {
        let mut map = self.credentials.write().await;
        let cred = map
            .get_mut(&(provider, id.to_string()))
            .ok_or(StoreError::NotFound)?;
        cred.quota = quota;
        cred.quota_fetched_at = Some(Utc::now());
        cred.updated_at = Utc::now();
        Ok(())
    }

    async fn move_to_error(
        &self,
        provider: Provider,
        id: &str,
        message: &str,
    ) -> StoreResult<ErrorCredential> {
        let snapshot = self.find_credential(provider, id).await?;
        let mut errors = self.error_credentials.write().await;
        let key = (provider, id.to_string());
        let entry = if let Some(existing) = errors.get_mut(&key) {
            existing.error_count += 1;
            existing.error_message = message.to_string();
            existing.last_error_at = Utc::now();
            existing.snapshot = snapshot;
            existing.clone()
        } else {
            let mut seq = self.error_seq.write().await;
            *seq += 1;
            let new_entry = ErrorCredential {
                id: format!("err-{}", *seq),
                original_id: id.to_string(),
                provider,
                snapshot,
                error_message: message.to_string(),
                error_count: 1,
                last_error_at: Utc::now(),
            };
            errors.insert(key, new_entry.clone());
            new_entry
        };

        let mut creds = self.credentials.write().await;
        if let Some(cred) = creds.get_mut(&(provider, id.to_string())) {
            cred.active = false;
        }

        Ok(entry)
    }

    async fn list_error_credentials(&self, provider: Provider) -> StoreResult<Vec<ErrorCredential>> {
        Ok(self
            .error_credentials
            .read()
            .await
            .values()
            .filter(|e| e.provider == provider)
            .cloned()
            .collect())
    }

    async fn restore_from_error(
        &self,
        provider: Provider,
        error_id: &str,
        new_access_secret: String,
        new_refresh_secret: Option<String>,
    ) -> StoreResult<Credential> {
        let errors = self.error_credentials.read().await;
        let entry = errors
            .values()
            .find(|e| e.provider == provider && e.id == error_id)
            .cloned()
            .ok_or(StoreError::NotFound)?;
        drop(errors);

        let mut restored = entry.snapshot.clone();
        restored.access_secret = new_access_secret;
        restored.refresh_secret = new_refresh_secret;
        restored.active = true;
        restored.error_count = 0;
        restored.last_error_message = None;
        restored.updated_at = Utc::now();

        self.credentials
            .write()
            .await
            .insert((provider, restored.id.clone()), restored.clone());
        self.error_credentials
            .write()
            .await
            .remove(&(provider, entry.original_id));

        Ok(restored)
    }

    async fn get_health(&self, provider: Provider, credential_id: &str) -> StoreResult<Health> {
        Ok(self
            .health
            .read()
            .await
            .get(&(provider, credential_id.to_string()))
            .cloned()
            .unwrap_or_else(|| Health::neutral(provider, credential_id)))
    }

    async fn upsert_health(&self, health: Health) -> StoreResult<()> {
        self.health
            .write()
            .await
            .insert((health.provider, health.credential_id.clone()), health);
        Ok(())
    }

    async fn get_bucket(&self, provider: Provider, credential_id: &str) -> StoreResult<TokenBucket> {
        Ok(self
            .buckets
            .read()
            .await
            .get(&(provider, credential_id.to_string()))
            .cloned()
            .unwrap_or(TokenBucket {
                provider,
                credential_id: credential_id.to_string(),
                tokens: 50.0,
                last_updated: Utc::now(),
            }))
    }

    async fn upsert_bucket(&self, bucket: TokenBucket) -> StoreResult<()> {
        self.buckets
            .write()
            .await
            .insert((bucket.provider, bucket.credential_id.clone()), bucket);
        Ok(())
    }

    async fn insert_api_key(&self, key: ApiKey) -> StoreResult<()> {
        let mut map = self.api_keys.write().await;
        if map.contains_key(&key.key_hash) {
            return Err(StoreError::Conflict("key_hash already exists".into()));
        }
        map.insert(key.key_hash.clone(), key);
        Ok(())
    }

    async fn find_api_key_by_hash(&self, key_hash: &str) -> StoreResult<ApiKey> {
        self.api_keys
            .read()
            .await
            .get(key_hash)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn set_api_key_active(&self, id: Uuid, active: bool) -> StoreResult<()> {
        let mut map = self.api_keys.write().await;
        let key = map
            .values_mut()
            .find(|k| k.id == id)
            .ok_or(StoreError::NotFound)?;
        key.active = active;
        Ok(())
    }

    async fn touch_api_key_last_used(&self, id: Uuid) -> StoreResult<()> {
        let mut map = self.api_keys.write().await;
        let key = map
            .values_mut()
            .find(|k| k.id == id)
            .ok_or(StoreError::NotFound)?;
        key.last_used_at = Some(Utc::now());
        Ok(())
    }

    async fn insert_api_log(&self, log: ApiLog) -> StoreResult<()> {
        self.api_logs.write().await.push(log);
        Ok(())
    }

    async fn usage_since(&self, api_key_id: Uuid, since: DateTime<Utc>) -> StoreResult<UsageCounters> {
        let logs = self.api_logs.read().await;
        let request_count = logs
            .iter()
            .filter(|l| l.api_key_id == Some(api_key_id) && l.created_at >= since)
            .count() as u64;
        Ok(UsageCounters {
            request_count,
            cost: 0.0,
        })
    }

    async fn delete_logs_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut logs = self.api_logs.write().await;
        let before = logs.len();
        logs.retain(|l| l.created_at >= cutoff);
        Ok((before - logs.len()) as u64)
    }

    async fn get_thinking_signature(&self, hash: &str) -> StoreResult<Option<ThinkingSignatureEntry>> {
        Ok(self
            .thinking_cache
            .read()
            .await
            .get(hash)
            .filter(|e| e.expires_at > Utc::now())
            .cloned())
    }

    async fn put_thinking_signature(&self, entry: ThinkingSignatureEntry) -> StoreResult<()> {
        self.thinking_cache
            .write()
            .await
            .insert(entry.hash.clone(), entry);
        Ok(())
    }

    async fn list_model_aliases(&self, alias: &str, provider: Provider) -> StoreResult<Vec<ModelAlias>> {
        let mut rows: Vec<ModelAlias> = self
            .model_aliases
            .read()
            .await
            .iter()
            .filter(|a| a.alias == alias && a.provider == provider && a.active)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(rows)
    }

    async fn upsert_model_alias(&self, row: ModelAlias) -> StoreResult<()> {
        let mut rows = self.model_aliases.write().await;
        if let Some(existing) = rows
            .iter_mut()
            .find(|a| a.alias == row.alias && a.provider == row.provider)
        {
            *existing = row;
        } else {
            rows.push(row);
        }
        Ok(())
    }

    async fn get_model_pricing(&self, model_name: &str) -> StoreResult<Option<ModelPricing>> {
        Ok(self.model_pricing.read().await.get(model_name).cloned())
    }

    async fn upsert_model_pricing(&self, row: ModelPricing) -> StoreResult<()> {
        let mut map = self.model_pricing.write().await;
        if let Some(existing) = map.get(&row.model_name) {
            if existing.suppresses_remote_overwrite() && row.source == super::PricingSource::Remote
            {
                return Ok(());
            }
        }
        map.insert(row.model_name.clone(), row);
        Ok(())
    }

    async fn load_settings(&self) -> StoreResult<Option<GlobalSettings>> {
        Ok(self.settings.read().await.clone())
    }

    async fn save_settings(&self, settings: &GlobalSettings) -> StoreResult<()> {
        *self.settings.write().await = Some(settings.clone());
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Convenience used by tests that need a shared store instance.
pub fn shared_memory_store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::default())
}
