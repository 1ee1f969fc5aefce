//! MySQL-backed store (production backend).
//!
//! Uses runtime-checked `sqlx::query`/`query_as` rather than the
//! compile-time `query!` macros, since there is no live database reachable
//! at build time. Schema is created on startup with `CREATE TABLE IF NOT
//! EXISTS` — migrate-on-connect, no external migration runner.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySqlPool, Row};
use uuid::Uuid;

use super::{
    ApiKey, ApiKeyLimits, ApiLog, AuxAuthFields, Credential, ErrorCredential, Health, ModelAlias,
    ModelPricing, PricingSource, Provider, QuotaEntry, Store, StoreError, StoreResult,
    ThinkingSignatureEntry, TokenBucket, UsageCounters,
};
use crate::config::DatabaseConfig;
use crate::settings::GlobalSettings;

pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(16)
            .connect(&config.connection_url())
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS credentials (
                provider VARCHAR(32) NOT NULL,
                id VARCHAR(128) NOT NULL,
                display_name VARCHAR(256) NOT NULL,
                access_secret TEXT NOT NULL,
                refresh_secret TEXT,
                aux_json TEXT NOT NULL,
                expiry DATETIME(3) NULL,
                active BOOLEAN NOT NULL DEFAULT TRUE,
                use_count BIGINT UNSIGNED NOT NULL DEFAULT 0,
                last_used_at DATETIME(3) NULL,
                error_count INT UNSIGNED NOT NULL DEFAULT 0,
                last_error_message TEXT,
                last_error_at DATETIME(3) NULL,
                quota_json TEXT NOT NULL,
                quota_fetched_at DATETIME(3) NULL,
                created_at DATETIME(3) NOT NULL,
                updated_at DATETIME(3) NOT NULL,
                PRIMARY KEY (provider, id)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS error_credentials (
                provider VARCHAR(32) NOT NULL,
                original_id VARCHAR(128) NOT NULL,
                error_id VARCHAR(64) NOT NULL,
                snapshot_json TEXT NOT NULL,
                error_message TEXT NOT NULL,
                error_count INT UNSIGNED NOT NULL DEFAULT 1,
                last_error_at DATETIME(3) NOT NULL,
                PRIMARY KEY (provider, original_id)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS health (
                provider VARCHAR(32) NOT NULL,
                credential_id VARCHAR(128) NOT NULL,
                score DOUBLE NOT NULL,
                consecutive_failures INT UNSIGNED NOT NULL DEFAULT 0,
                last_success_at DATETIME(3) NULL,
                last_failure_at DATETIME(3) NULL,
                last_error_message TEXT,
                PRIMARY KEY (provider, credential_id)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS token_buckets (
                provider VARCHAR(32) NOT NULL,
                credential_id VARCHAR(128) NOT NULL,
                tokens DOUBLE NOT NULL,
                last_updated DATETIME(3) NOT NULL,
                PRIMARY KEY (provider, credential_id)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS api_keys (
                id CHAR(36) NOT NULL PRIMARY KEY,
                user_id VARCHAR(128) NOT NULL,
                name VARCHAR(256) NOT NULL,
                key_hash CHAR(64) NOT NULL UNIQUE,
                key_prefix VARCHAR(16) NOT NULL,
                active BOOLEAN NOT NULL DEFAULT TRUE,
                limits_json TEXT NOT NULL,
                created_at DATETIME(3) NOT NULL,
                last_used_at DATETIME(3) NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS api_logs (
                request_id CHAR(36) NOT NULL PRIMARY KEY,
                api_key_id CHAR(36) NULL,
                credential_id VARCHAR(128) NULL,
                model VARCHAR(128) NOT NULL,
                input_tokens BIGINT UNSIGNED NOT NULL,
                output_tokens BIGINT UNSIGNED NOT NULL,
                status_code SMALLINT UNSIGNED NOT NULL,
                duration_ms BIGINT UNSIGNED NOT NULL,
                path VARCHAR(256) NOT NULL,
                source VARCHAR(64) NOT NULL,
                created_at DATETIME(3) NOT NULL,
                INDEX idx_api_logs_key_time (api_key_id, created_at)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS thinking_signature_cache (
                hash CHAR(64) NOT NULL PRIMARY KEY,
                value LONGTEXT NOT NULL,
                model_family VARCHAR(128) NOT NULL,
                expires_at DATETIME(3) NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS model_aliases (
                alias VARCHAR(128) NOT NULL,
                provider VARCHAR(32) NOT NULL,
                target_model VARCHAR(128) NOT NULL,
                priority INT NOT NULL DEFAULT 0,
                active BOOLEAN NOT NULL DEFAULT TRUE,
                PRIMARY KEY (alias, provider)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS model_pricing (
                model_name VARCHAR(128) NOT NULL PRIMARY KEY,
                input_price_per_m DOUBLE NOT NULL,
                output_price_per_m DOUBLE NOT NULL,
                provider VARCHAR(32) NOT NULL,
                source VARCHAR(16) NOT NULL,
                is_custom BOOLEAN NOT NULL DEFAULT FALSE
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS settings (
                id TINYINT NOT NULL PRIMARY KEY DEFAULT 1,
                settings_json LONGTEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn row_to_credential(row: &sqlx::mysql::MySqlRow) -> StoreResult<Credential> {
    let provider_str: String = row.try_get("provider").map_err(anyhow::Error::from)?;
    let provider = Provider::parse(&provider_str)
        .ok_or_else(|| StoreError::Backend(anyhow::anyhow!("unknown provider {provider_str}")))?;
    let aux_json: String = row.try_get("aux_json").map_err(anyhow::Error::from)?;
    let aux: AuxAuthFields = serde_json::from_str(&aux_json).map_err(anyhow::Error::from)?;
    let quota_json: String = row.try_get("quota_json").map_err(anyhow::Error::from)?;
    let quota: HashMap<String, QuotaEntry> =
        serde_json::from_str(&quota_json).map_err(anyhow::Error::from)?;

    Ok(Credential {
        id: row.try_get("id").map_err(anyhow::Error::from)?,
        provider,
        display_name: row.try_get("display_name").map_err(anyhow::Error::from)?,
        access_secret: row.try_get("access_secret").map_err(anyhow::Error::from)?,
        refresh_secret: row.try_get("refresh_secret").map_err(anyhow::Error::from)?,
        aux,
        expiry: row.try_get("expiry").map_err(anyhow::Error::from)?,
        active: row.try_get("active").map_err(anyhow::Error::from)?,
        use_count: row.try_get::<i64, _>("use_count").map_err(anyhow::Error::from)? as u64,
        last_used_at: row.try_get("last_used_at").map_err(anyhow::Error::from)?,
        error_count: row.try_get::<i64, _>("error_count").map_err(anyhow::Error::from)? as u32,
        last_error_message: row
            .try_get("last_error_message")
            .map_err(anyhow::Error::from)?,
        last_error_at: row.try_get("last_error_at").map_err(anyhow::Error::from)?,
        quota,
        quota_fetched_at: row
            .try_get("quota_fetched_at")
            .map_err(anyhow::Error::from)?,
        created_at: row.try_get("created_at").map_err(anyhow::Error::from)?,
        updated_at: row.try_get("updated_at").map_err(anyhow::Error::from)?,
    })
}

#[async_trait]
impl Store for MySqlStore {
    async fn insert_credential(&self, c: Credential) -> StoreResult<()> {
        let aux_json = serde_json::to_string(&c.aux).map_err(anyhow::Error::from)?;
        let quota_json = serde_json::to_string(&c.quota).map_err(anyhow::Error::from)?;
        sqlx::query(
            r#"INSERT INTO credentials
                (provider, id, display_name, access_secret, refresh_secret, aux_json, expiry,
                 active, use_count, last_used_at, error_count, last_error_message, last_error_at,
                 quota_json, quota_fetched_at, created_at, updated_at)
               VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)"#,
        )
        .bind(c.provider.as_str())
        .bind(&c.id)
        .bind(&c.display_name)
        .bind(&c.access_secret)
        .bind(&c.refresh_secret)
        .bind(&aux_json)
        .bind(c.expiry)
        .bind(c.active)
        .bind(c.use_count as i64)
        .bind(c.last_used_at)
        .bind(c.error_count as i64)
        .bind(&c.last_error_message)
        .bind(c.last_error_at)
        .bind(&quota_json)
        .bind(c.quota_fetched_at)
        .bind(c.created_at)
        .bind(c.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(format!("credential {} already exists", c.id))
            }
            other => StoreError::Backend(other.into()),
        })?;
        Ok(())
    }

    async fn update_credential(&self, c: Credential) -> StoreResult<()> {
        let aux_json = serde_json::to_string(&c.aux).map_err(anyhow::Error::from)?;
        let quota_json = serde_json::to_string(&c.quota).map_err(anyhow::Error::from)?;
        let result = sqlx::query(
            r#"UPDATE credentials SET display_name=?, access_secret=?, refresh_secret=?,
                aux_json=?, expiry=?, active=?, use_count=?, last_used_at=?, error_count=?,
                last_error_message=?, last_error_at=?, quota_json=?, quota_fetched_at=?, updated_at=?
               WHERE provider=? AND id=?"#,
        )
        .bind(&c.display_name)
        .bind(&c.access_secret)
        .bind(&c.refresh_secret)
        .bind(&aux_json)
        .bind(c.expiry)
        .bind(c.active)
        .bind(c.use_count as i64)
        .bind(c.last_used_at)
        .bind(c.error_count as i64)
        .bind(&c.last_error_message)
        .bind(c.last_error_at)
        .bind(&quota_json)
        .bind(c.quota_fetched_at)
        .bind(c.updated_at)
        .bind(c.provider.as_str())
        .bind(&c.id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn delete_credential(&self, provider: Provider, id: &str) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM credentials WHERE provider=? AND id=?")
            .bind(provider.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn find_credential(&self, provider: Provider, id: &str) -> StoreResult<Credential> {
        let row = sqlx::query("SELECT * FROM credentials WHERE provider=? AND id=?")
            .bind(provider.as_str())
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?
            .ok_or(StoreError::NotFound)?;
        row_to_credential(&row)
    }

    async fn find_credential_by_name(
        &self,
        provider: Provider,
        name: &str,
    ) -> StoreResult<Credential> {
        let row = sqlx::query("SELECT * FROM credentials WHERE provider=? AND display_name=?")
            .bind(provider.as_str())
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?
            .ok_or(StoreError::NotFound)?;
        row_to_credential(&row)
    }

    async fn list_credentials(&self, provider: Provider) -> StoreResult<Vec<Credential>> {
        let rows = sqlx::query(
            "SELECT * FROM credentials WHERE provider=? ORDER BY error_count ASC, updated_at DESC",
        )
        .bind(provider.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        rows.iter().map(row_to_credential).collect()
    }

    async fn list_active_credentials(&self, provider: Provider) -> StoreResult<Vec<Credential>> {
        let rows = sqlx::query(
            "SELECT * FROM credentials WHERE provider=? AND active=TRUE ORDER BY error_count ASC, updated_at DESC",
        )
        .bind(provider.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        rows.iter().map(row_to_credential).collect()
    }

    async fn increment_use_count(&self, provider: Provider, id: &str) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE credentials SET use_count = use_count + 1, last_used_at = ?, updated_at = ? WHERE provider=? AND id=?",
        )
        .bind(Utc::now())
        .bind(Utc::now())
        .bind(provider.as_str())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn record_error_count(
        &self,
        provider: Provider,
        id: &str,
        message: &str,
    ) -> StoreResult<u32> {
        let result = sqlx::query(
            "UPDATE credentials SET error_count = error_count + 1, last_error_message=?, last_error_at=?, updated_at=? WHERE provider=? AND id=?",
        )
        .bind(message)
        .bind(Utc::now())
        .bind(Utc::now())
        .bind(provider.as_str())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        let cred = self.find_credential(provider, id).await?;
        Ok(cred.error_count)
    }

    async fn reset_error_count(&self, provider: Provider, id: &str) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE credentials SET error_count=0, last_error_message=NULL, updated_at=? WHERE provider=? AND id=?",
        )
        .bind(Utc::now())
        .bind(provider.as_str())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn update_quota(
        &self,
        provider: Provider,
        id: &str,
        quota: HashMap<String, QuotaEntry>,
    ) -> StoreResult<()> {
        let quota_json = serde_json::to_string(&quota).map_err(anyhow::Error::from)?;
        let result = sqlx::query(
            "UPDATE credentials SET quota_json=?, quota_fetched_at=?, updated_at=? WHERE provider=? AND id=?",
        )
        .bind(&quota_json)
        .bind(Utc::now())
        .bind(Utc::now())
        .bind(provider.as_str())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn move_to_error(
        &self,
        provider: Provider,
        id: &str,
        message: &str,
    ) -> StoreResult<ErrorCredential> {
        let snapshot = self.find_credential(provider, id).await?;
        let snapshot_json = serde_json::to_string(&snapshot).map_err(anyhow::Error::from)?;

        let existing = sqlx::query(
            "SELECT error_id, error_count FROM error_credentials WHERE provider=? AND original_id=?",
        )
        .bind(provider.as_str())
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        let (error_id, error_count) = if let Some(row) = existing {
            let error_id: String = row.try_get("error_id").map_err(anyhow::Error::from)?;
            let count: i64 = row.try_get("error_count").map_err(anyhow::Error::from)?;
            let new_count = count + 1;
            sqlx::query(
                "UPDATE error_credentials SET snapshot_json=?, error_message=?, error_count=?, last_error_at=? WHERE provider=? AND original_id=?",
            )
            .bind(&snapshot_json)
            .bind(message)
            .bind(new_count)
            .bind(Utc::now())
            .bind(provider.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
            (error_id, new_count as u32)
        } else {
            let error_id = format!("err-{}", Uuid::new_v4());
            sqlx::query(
                r#"INSERT INTO error_credentials
                    (provider, original_id, error_id, snapshot_json, error_message, error_count, last_error_at)
                   VALUES (?,?,?,?,?,1,?)"#,
            )
            .bind(provider.as_str())
            .bind(id)
            .bind(&error_id)
            .bind(&snapshot_json)
            .bind(message)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
            (error_id, 1)
        };

        sqlx::query("UPDATE credentials SET active=FALSE, updated_at=? WHERE provider=? AND id=?")
            .bind(Utc::now())
            .bind(provider.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;

        Ok(ErrorCredential {
            id: error_id,
            original_id: id.to_string(),
            provider,
            snapshot,
            error_message: message.to_string(),
            error_count,
            last_error_at: Utc::now(),
        })
    }

    async fn list_error_credentials(&self, provider: Provider) -> StoreResult<Vec<ErrorCredential>> {
        let rows = sqlx::query("SELECT * FROM error_credentials WHERE provider=?")
            .bind(provider.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        rows.iter()
            .map(|row| {
                let snapshot_json: String =
                    row.try_get("snapshot_json").map_err(anyhow::Error::from)?;
                let snapshot: Credential =
                    serde_json::from_str(&snapshot_json).map_err(anyhow::Error::from)?;
                Ok(ErrorCredential {
                    id: row.try_get("error_id").map_err(anyhow::Error::from)?,
                    original_id: row.try_get("original_id").map_err(anyhow::Error::from)?,
                    provider,
                    snapshot,
                    error_message: row.try_get("error_message").map_err(anyhow::Error::from)?,
                    error_count: row.try_get::<i64, _>("error_count").map_err(anyhow::Error::from)? as u32,
                    last_error_at: row.try_get("last_error_at").map_err(anyhow::Error::from)?,
                })
            })
            .collect()
    }

    async fn restore_from_error(
        &self,
        provider: Provider,
        error_id: &str,
        new_access_secret: String,
        new_refresh_secret: Option<String>,
    ) -> StoreResult<Credential> {
        let row = sqlx::query("SELECT * FROM error_credentials WHERE provider=? AND error_id=?")
            .bind(provider.as_str())
            .bind(error_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?
            .ok_or(StoreError::NotFound)?;
        let snapshot_json: String = row.try_get("snapshot_json").map_err(anyhow::Error::from)?;
        let original_id: String = row.try_get("original_id").map_err(anyhow::Error::from)?;
        let mut restored: Credential =
            serde_json::from_str(&snapshot_json).map_err(anyhow::Error::from)?;
        restored.access_secret = new_access_secret;
        restored.refresh_secret = new_refresh_secret;
        restored.active = true;
        restored.error_count = 0;
        restored.last_error_message = None;
        restored.updated_at = Utc::now();

        match self.update_credential(restored.clone()).await {
            Ok(()) => {}
            Err(StoreError::NotFound) => self.insert_credential(restored.clone()).await?,
            Err(e) => return Err(e),
        }

        sqlx::query("DELETE FROM error_credentials WHERE provider=? AND original_id=?")
            .bind(provider.as_str())
            .bind(&original_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;

        Ok(restored)
    }

    async fn get_health(&self, provider: Provider, credential_id: &str) -> StoreResult<Health> {
        let row = sqlx::query("SELECT * FROM health WHERE provider=? AND credential_id=?")
            .bind(provider.as_str())
            .bind(credential_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        match row {
            Some(row) => Ok(Health {
                provider,
                credential_id: row.try_get("credential_id").map_err(anyhow::Error::from)?,
                score: row.try_get("score").map_err(anyhow::Error::from)?,
                consecutive_failures: row
                    .try_get::<i64, _>("consecutive_failures")
                    .map_err(anyhow::Error::from)? as u32,
                last_success_at: row.try_get("last_success_at").map_err(anyhow::Error::from)?,
                last_failure_at: row.try_get("last_failure_at").map_err(anyhow::Error::from)?,
                last_error_message: row
                    .try_get("last_error_message")
                    .map_err(anyhow::Error::from)?,
            }),
            None => Ok(Health::neutral(provider, credential_id)),
        }
    }

    async fn upsert_health(&self, h: Health) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO health (provider, credential_id, score, consecutive_failures,
                last_success_at, last_failure_at, last_error_message)
               VALUES (?,?,?,?,?,?,?)
               ON DUPLICATE KEY UPDATE score=VALUES(score),
                consecutive_failures=VALUES(consecutive_failures),
                last_success_at=VALUES(last_success_at),
                last_failure_at=VALUES(last_failure_at),
                last_error_message=VALUES(last_error_message)"#,
        )
        .bind(h.provider.as_str())
        .bind(&h.credential_id)
        .bind(h.score)
        .bind(h.consecutive_failures as i64)
        .bind(h.last_success_at)
        .bind(h.last_failure_at)
        .bind(&h.last_error_message)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn get_bucket(&self, provider: Provider, credential_id: &str) -> StoreResult<TokenBucket> {
        let row = sqlx::query("SELECT * FROM token_buckets WHERE provider=? AND credential_id=?")
            .bind(provider.as_str())
            .bind(credential_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        match row {
            Some(row) => Ok(TokenBucket {
                provider,
                credential_id: row.try_get("credential_id").map_err(anyhow::Error::from)?,
                tokens: row.try_get("tokens").map_err(anyhow::Error::from)?,
                last_updated: row.try_get("last_updated").map_err(anyhow::Error::from)?,
            }),
            None => Ok(TokenBucket {
                provider,
                credential_id: credential_id.to_string(),
                tokens: 50.0,
                last_updated: Utc::now(),
            }),
        }
    }

    async fn upsert_bucket(&self, b: TokenBucket) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO token_buckets (provider, credential_id, tokens, last_updated)
               VALUES (?,?,?,?)
               ON DUPLICATE KEY UPDATE tokens=VALUES(tokens), last_updated=VALUES(last_updated)"#,
        )
        .bind(b.provider.as_str())
        .bind(&b.credential_id)
        .bind(b.tokens)
        .bind(b.last_updated)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn insert_api_key(&self, key: ApiKey) -> StoreResult<()> {
        let limits_json = serde_json::to_string(&key.limits).map_err(anyhow::Error::from)?;
        sqlx::query(
            r#"INSERT INTO api_keys (id, user_id, name, key_hash, key_prefix, active, limits_json, created_at, last_used_at)
               VALUES (?,?,?,?,?,?,?,?,?)"#,
        )
        .bind(key.id.to_string())
        .bind(&key.user_id)
        .bind(&key.name)
        .bind(&key.key_hash)
        .bind(&key.key_prefix)
        .bind(key.active)
        .bind(&limits_json)
        .bind(key.created_at)
        .bind(key.last_used_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict("key_hash already exists".into())
            }
            other => StoreError::Backend(other.into()),
        })?;
        Ok(())
    }

    async fn find_api_key_by_hash(&self, key_hash: &str) -> StoreResult<ApiKey> {
        let row = sqlx::query("SELECT * FROM api_keys WHERE key_hash=?")
            .bind(key_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?
            .ok_or(StoreError::NotFound)?;
        let limits_json: String = row.try_get("limits_json").map_err(anyhow::Error::from)?;
        let limits: ApiKeyLimits = serde_json::from_str(&limits_json).map_err(anyhow::Error::from)?;
        let id_str: String = row.try_get("id").map_err(anyhow::Error::from)?;
        Ok(ApiKey {
            id: Uuid::parse_str(&id_str).map_err(anyhow::Error::from)?,
            user_id: row.try_get("user_id").map_err(anyhow::Error::from)?,
            name: row.try_get("name").map_err(anyhow::Error::from)?,
            key_value: None,
            key_hash: row.try_get("key_hash").map_err(anyhow::Error::from)?,
            key_prefix: row.try_get("key_prefix").map_err(anyhow::Error::from)?,
            active: row.try_get("active").map_err(anyhow::Error::from)?,
            limits,
            created_at: row.try_get("created_at").map_err(anyhow::Error::from)?,
            last_used_at: row.try_get("last_used_at").map_err(anyhow::Error::from)?,
        })
    }

    async fn set_api_key_active(&self, id: Uuid, active: bool) -> StoreResult<()> {
        let result = sqlx::query("UPDATE api_keys SET active=? WHERE id=?")
            .bind(active)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn touch_api_key_last_used(&self, id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("UPDATE api_keys SET last_used_at=? WHERE id=?")
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn insert_api_log(&self, log: ApiLog) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO api_logs
                (request_id, api_key_id, credential_id, model, input_tokens, output_tokens,
                 status_code, duration_ms, path, source, created_at)
               VALUES (?,?,?,?,?,?,?,?,?,?,?)"#,
        )
        .bind(log.request_id.to_string())
        .bind(log.api_key_id.map(|u| u.to_string()))
        .bind(&log.credential_id)
        .bind(&log.model)
        .bind(log.input_tokens as i64)
        .bind(log.output_tokens as i64)
        .bind(log.status_code as i32)
        .bind(log.duration_ms as i64)
        .bind(&log.path)
        .bind(&log.source)
        .bind(log.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn usage_since(&self, api_key_id: Uuid, since: DateTime<Utc>) -> StoreResult<UsageCounters> {
        let row = sqlx::query(
            "SELECT COUNT(*) as cnt FROM api_logs WHERE api_key_id=? AND created_at >= ?",
        )
        .bind(api_key_id.to_string())
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        let request_count: i64 = row.try_get("cnt").map_err(anyhow::Error::from)?;
        Ok(UsageCounters {
            request_count: request_count as u64,
            cost: 0.0,
        })
    }

    async fn delete_logs_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM api_logs WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(result.rows_affected())
    }

    async fn get_thinking_signature(&self, hash: &str) -> StoreResult<Option<ThinkingSignatureEntry>> {
        let row = sqlx::query(
            "SELECT * FROM thinking_signature_cache WHERE hash=? AND expires_at > ?",
        )
        .bind(hash)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        match row {
            Some(row) => Ok(Some(ThinkingSignatureEntry {
                hash: row.try_get("hash").map_err(anyhow::Error::from)?,
                value: row.try_get("value").map_err(anyhow::Error::from)?,
                model_family: row.try_get("model_family").map_err(anyhow::Error::from)?,
                expires_at: row.try_get("expires_at").map_err(anyhow::Error::from)?,
            })),
            None => Ok(None),
        }
    }

    async fn put_thinking_signature(&self, entry: ThinkingSignatureEntry) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO thinking_signature_cache (hash, value, model_family, expires_at)
               VALUES (?,?,?,?)
               ON DUPLICATE KEY UPDATE value=VALUES(value), model_family=VALUES(model_family),
                expires_at=VALUES(expires_at)"#,
        )
        .bind(&entry.hash)
        .bind(&entry.value)
        .bind(&entry.model_family)
        .bind(entry.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn list_model_aliases(&self, alias: &str, provider: Provider) -> StoreResult<Vec<ModelAlias>> {
        let rows = sqlx::query(
            "SELECT * FROM model_aliases WHERE alias=? AND provider=? AND active=TRUE ORDER BY priority DESC",
        )
        .bind(alias)
        .bind(provider.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        rows.iter()
            .map(|row| {
                Ok(ModelAlias {
                    alias: row.try_get("alias").map_err(anyhow::Error::from)?,
                    provider,
                    target_model: row.try_get("target_model").map_err(anyhow::Error::from)?,
                    priority: row.try_get("priority").map_err(anyhow::Error::from)?,
                    active: row.try_get("active").map_err(anyhow::Error::from)?,
                })
            })
            .collect()
    }

    async fn upsert_model_alias(&self, row: ModelAlias) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO model_aliases (alias, provider, target_model, priority, active)
               VALUES (?,?,?,?,?)
               ON DUPLICATE KEY UPDATE target_model=VALUES(target_model),
                priority=VALUES(priority), active=VALUES(active)"#,
        )
        .bind(&row.alias)
        .bind(row.provider.as_str())
        .bind(&row.target_model)
        .bind(row.priority)
        .bind(row.active)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn get_model_pricing(&self, model_name: &str) -> StoreResult<Option<ModelPricing>> {
        let row = sqlx::query("SELECT * FROM model_pricing WHERE model_name=?")
            .bind(model_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        match row {
            Some(row) => {
                let provider_str: String = row.try_get("provider").map_err(anyhow::Error::from)?;
                let provider = Provider::parse(&provider_str).ok_or_else(|| {
                    StoreError::Backend(anyhow::anyhow!("unknown provider {provider_str}"))
                })?;
                let source_str: String = row.try_get("source").map_err(anyhow::Error::from)?;
                let source = match source_str.as_str() {
                    "remote" => PricingSource::Remote,
                    "manual" => PricingSource::Manual,
                    _ => PricingSource::Default,
                };
                Ok(Some(ModelPricing {
                    model_name: row.try_get("model_name").map_err(anyhow::Error::from)?,
                    input_price_per_m: row
                        .try_get("input_price_per_m")
                        .map_err(anyhow::Error::from)?,
                    output_price_per_m: row
                        .try_get("output_price_per_m")
                        .map_err(anyhow::Error::from)?,
                    provider,
                    source,
                    is_custom: row.try_get("is_custom").map_err(anyhow::Error::from)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn upsert_model_pricing(&self, row: ModelPricing) -> StoreResult<()> {
        if let Some(existing) = self.get_model_pricing(&row.model_name).await? {
            if existing.suppresses_remote_overwrite() && row.source == PricingSource::Remote {
                return Ok(());
            }
        }
        let source_str = match row.source {
            PricingSource::Default => "default",
            PricingSource::Remote => "remote",
            PricingSource::Manual => "manual",
        };
        sqlx::query(
            r#"INSERT INTO model_pricing (model_name, input_price_per_m, output_price_per_m, provider, source, is_custom)
               VALUES (?,?,?,?,?,?)
               ON DUPLICATE KEY UPDATE input_price_per_m=VALUES(input_price_per_m),
                output_price_per_m=VALUES(output_price_per_m), provider=VALUES(provider),
                source=VALUES(source), is_custom=VALUES(is_custom)"#,
        )
        .bind(&row.model_name)
        .bind(row.input_price_per_m)
        .bind(row.output_price_per_m)
        .bind(row.provider.as_str())
        .bind(source_str)
        .bind(row.is_custom)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn load_settings(&self) -> StoreResult<Option<GlobalSettings>> {
        let row = sqlx::query("SELECT settings_json FROM settings WHERE id=1")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        match row {
            Some(row) => {
                let json: String = row.try_get("settings_json").map_err(anyhow::Error::from)?;
                Ok(Some(
                    serde_json::from_str(&json).map_err(anyhow::Error::from)?,
                ))
            }
            None => Ok(None),
        }
    }

    async fn save_settings(&self, settings: &GlobalSettings) -> StoreResult<()> {
        let json = serde_json::to_string(settings).map_err(anyhow::Error::from)?;
        sqlx::query(
            r#"INSERT INTO settings (id, settings_json) VALUES (1, ?)
               ON DUPLICATE KEY UPDATE settings_json=VALUES(settings_json)"#,
        )
        .bind(&json)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }
}
