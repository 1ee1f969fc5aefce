//! Credential registry (C2).
//!
//! Thin, typed wrapper over [`crate::store::Store`]'s credential methods,
//! following `kiro.rs`'s `AdminService` shape: a service struct that owns the
//! store handle and exposes CRUD plus a `stats()` admin summary, with error
//! classification kept local to each operation rather than leaking raw store
//! errors to callers.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;

use crate::store::{Credential, ErrorCredential, Provider, QuotaEntry, Store, StoreError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("credential not found")]
    NotFound,
    #[error("credential already exists: {0}")]
    AlreadyExists(String),
    #[error("registry backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl From<StoreError> for RegistryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => RegistryError::NotFound,
            StoreError::Conflict(msg) => RegistryError::AlreadyExists(msg),
            StoreError::Backend(e) => RegistryError::Backend(e),
        }
    }
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Summary view for the admin pool-status endpoint, mirroring `kiro.rs`'s
/// `CredentialsStatusResponse`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    pub provider: Provider,
    pub total: usize,
    pub active: usize,
    pub quarantined: usize,
}

pub struct CredentialRegistry {
    store: Arc<dyn Store>,
}

impl CredentialRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn add(&self, credential: Credential) -> RegistryResult<()> {
        self.store.insert_credential(credential).await?;
        Ok(())
    }

    pub async fn update(&self, mut credential: Credential) -> RegistryResult<()> {
        credential.updated_at = Utc::now();
        self.store.update_credential(credential).await?;
        Ok(())
    }

    pub async fn delete(&self, provider: Provider, id: &str) -> RegistryResult<()> {
        self.store.delete_credential(provider, id).await?;
        Ok(())
    }

    pub async fn get_by_id(&self, provider: Provider, id: &str) -> RegistryResult<Credential> {
        Ok(self.store.find_credential(provider, id).await?)
    }

    pub async fn get_by_name(&self, provider: Provider, name: &str) -> RegistryResult<Credential> {
        Ok(self.store.find_credential_by_name(provider, name).await?)
    }

    pub async fn list(&self, provider: Provider) -> RegistryResult<Vec<Credential>> {
        Ok(self.store.list_credentials(provider).await?)
    }

    pub async fn list_active(&self, provider: Provider) -> RegistryResult<Vec<Credential>> {
        Ok(self.store.list_active_credentials(provider).await?)
    }

    pub async fn toggle_active(&self, provider: Provider, id: &str, active: bool) -> RegistryResult<()> {
        let mut cred = self.store.find_credential(provider, id).await?;
        cred.active = active;
        cred.updated_at = Utc::now();
        self.store.update_credential(cred).await?;
        Ok(())
    }

    /// Idempotent: repeated calls for the same `id` increment the existing
    /// error row's counter rather than creating duplicates.
    pub async fn move_to_error(
        &self,
        provider: Provider,
        id: &str,
        message: &str,
    ) -> RegistryResult<ErrorCredential> {
        Ok(self.store.move_to_error(provider, id, message).await?)
    }

    pub async fn list_error_credentials(&self, provider: Provider) -> RegistryResult<Vec<ErrorCredential>> {
        Ok(self.store.list_error_credentials(provider).await?)
    }

    pub async fn restore_from_error(
        &self,
        provider: Provider,
        error_id: &str,
        new_access_secret: String,
        new_refresh_secret: Option<String>,
    ) -> RegistryResult<Credential> {
        Ok(self
            .store
            .restore_from_error(provider, error_id, new_access_secret, new_refresh_secret)
            .await?)
    }

    pub async fn increment_use_count(&self, provider: Provider, id: &str) -> RegistryResult<()> {
        self.store.increment_use_count(provider, id).await?;
        Ok(())
    }

    pub async fn record_error_count(
        &self,
        provider: Provider,
        id: &str,
        message: &str,
    ) -> RegistryResult<u32> {
        Ok(self.store.record_error_count(provider, id, message).await?)
    }

    pub async fn reset_error_count(&self, provider: Provider, id: &str) -> RegistryResult<()> {
        self.store.reset_error_count(provider, id).await?;
        Ok(())
    }

    pub async fn update_quota(
        &self,
        provider: Provider,
        id: &str,
        quota: HashMap<String, QuotaEntry>,
    ) -> RegistryResult<()> {
        self.store.update_quota(provider, id, quota).await?;
        Ok(())
    }

    pub async fn is_quota_fresh(&self, provider: Provider, id: &str, quota_ttl_secs: i64) -> RegistryResult<bool> {
        let cred = self.store.find_credential(provider, id).await?;
        Ok(cred.is_quota_fresh(quota_ttl_secs))
    }

    /// Admin pool-status summary.
    pub async fn stats(&self, provider: Provider) -> RegistryResult<PoolStats> {
        let all = self.store.list_credentials(provider).await?;
        let quarantined = self.store.list_error_credentials(provider).await?.len();
        let active = all.iter().filter(|c| c.active).count();
        Ok(PoolStats {
            provider,
            total: all.len(),
            active,
            quarantined,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::AuxAuthFields;

    fn sample(id: &str) -> Credential {
        let now = Utc::now();
        Credential {
            id: id.to_string(),
            provider: Provider::Kiro,
            display_name: format!("cred-{id}"),
            access_secret: "secret".into(),
            refresh_secret: Some("refresh".into()),
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

    #[tokio::test]
    async fn move_to_error_is_idempotent_on_counter() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new().await.unwrap());
        let registry = CredentialRegistry::new(store);
        registry.add(sample("a")).await.unwrap();

        registry.move_to_error(Provider::Kiro, "a", "boom").await.unwrap();
        let second = registry
            .move_to_error(Provider::Kiro, "a", "boom again")
            .await
            .unwrap();

        assert_eq!(second.error_count, 2);
        assert_eq!(second.error_message, "boom again");
    }

    #[tokio::test]
    async fn deleted_credential_not_found() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new().await.unwrap());
        let registry = CredentialRegistry::new(store);
        registry.add(sample("b")).await.unwrap();
        registry.delete(Provider::Kiro, "b").await.unwrap();
        let err = registry.get_by_id(Provider::Kiro, "b").await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound));
    }

    #[tokio::test]
    async fn stats_counts_active_and_quarantined() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new().await.unwrap());
        let registry = CredentialRegistry::new(store);
        registry.add(sample("c1")).await.unwrap();
        registry.add(sample("c2")).await.unwrap();
        registry.move_to_error(Provider::Kiro, "c2", "fail").await.unwrap();

        let stats = registry.stats(Provider::Kiro).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.quarantined, 1);
    }
}
