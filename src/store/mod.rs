//! Persistent store — typed KV/row storage for credentials, health,
//! buckets, quotas, keys, and logs.
//!
//! The store is exposed as a trait (`Arc<dyn Store>`) so the gateway can run
//! against either a MySQL backend (driven by `MYSQL_*` env vars) or an
//! in-memory backend for tests.
//!
//! Insert/update/delete/find/list/count/upsert/increment operations are
//! expressed here as entity-specific methods rather than one generic
//! dynamic-filter API, which keeps call sites typed. No transactions are
//! required.

pub mod memory;
pub mod mysql;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::settings::GlobalSettings;

/// Provider tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Kiro,
    Anthropic,
    Gemini,
    Orchids,
    Warp,
    Vertex,
    Bedrock,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Kiro => "kiro",
            Provider::Anthropic => "anthropic",
            Provider::Gemini => "gemini",
            Provider::Orchids => "orchids",
            Provider::Warp => "warp",
            Provider::Vertex => "vertex",
            Provider::Bedrock => "bedrock",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "kiro" => Some(Provider::Kiro),
            "anthropic" => Some(Provider::Anthropic),
            "gemini" => Some(Provider::Gemini),
            "orchids" => Some(Provider::Orchids),
            "warp" => Some(Provider::Warp),
            "vertex" => Some(Provider::Vertex),
            "bedrock" => Some(Provider::Bedrock),
            _ => None,
        }
    }

    pub const ALL: [Provider; 7] = [
        Provider::Kiro,
        Provider::Anthropic,
        Provider::Gemini,
        Provider::Orchids,
        Provider::Warp,
        Provider::Vertex,
        Provider::Bedrock,
    ];
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-model quota snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaEntry {
    pub remaining_fraction: f64,
    pub reset_time: Option<DateTime<Utc>>,
}

/// Auxiliary, provider-specific auth fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuxAuthFields {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub profile_arn: Option<String>,
    pub region: Option<String>,
    pub start_url: Option<String>,
    /// Google service-account JSON (Vertex), when the access secret is
    /// structured rather than opaque.
    pub service_account_json: Option<String>,
    pub project_id: Option<String>,
    pub auth_method: Option<String>,
}

/// One record per upstream account, per provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub provider: Provider,
    pub display_name: String,
    pub access_secret: String,
    pub refresh_secret: Option<String>,
    pub aux: AuxAuthFields,
    pub expiry: Option<DateTime<Utc>>,
    pub active: bool,
    pub use_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub last_error_message: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub quota: std::collections::HashMap<String, QuotaEntry>,
    pub quota_fetched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    /// `quota.fetchedAt >= now - quotaTTL`.
    pub fn is_quota_fresh(&self, quota_ttl_secs: i64) -> bool {
        match self.quota_fetched_at {
            Some(t) => t >= Utc::now() - chrono::Duration::seconds(quota_ttl_secs),
            None => false,
        }
    }
}

/// A quarantined credential snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorCredential {
    pub id: String,
    pub original_id: String,
    pub provider: Provider,
    pub snapshot: Credential,
    pub error_message: String,
    /// Monotonic, incremented each time a credential is moved to quarantine
    /// again for the same `original_id` rather than inserting a duplicate row.
    pub error_count: u32,
    pub last_error_at: DateTime<Utc>,
}

/// Per-credential health state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    pub provider: Provider,
    pub credential_id: String,
    pub score: f64,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error_message: Option<String>,
}

impl Health {
    pub fn neutral(provider: Provider, credential_id: impl Into<String>) -> Self {
        Self {
            provider,
            credential_id: credential_id.into(),
            score: 70.0,
            consecutive_failures: 0,
            last_success_at: None,
            last_failure_at: None,
            last_error_message: None,
        }
    }
}

/// Per-credential token bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBucket {
    pub provider: Provider,
    pub credential_id: String,
    pub tokens: f64,
    pub last_updated: DateTime<Utc>,
}

/// Client-facing quota/budget limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiKeyLimits {
    pub daily: Option<u64>,
    pub monthly: Option<u64>,
    pub total: Option<u64>,
    pub concurrent: Option<u32>,
    pub rate: Option<u32>,
    pub daily_cost: Option<f64>,
    pub monthly_cost: Option<f64>,
    pub total_cost: Option<f64>,
    pub expires_in_days: Option<i64>,
}

/// Client-facing API key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: Uuid,
    pub user_id: String,
    pub name: String,
    /// Only ever populated at creation time; persisted as `key_hash`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_value: Option<String>,
    pub key_hash: String,
    pub key_prefix: String,
    pub active: bool,
    pub limits: ApiKeyLimits,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiKey {
    /// `expiresInDays > 0 => effectiveExpiry = createdAt + expiresInDays*day`.
    pub fn effective_expiry(&self) -> Option<DateTime<Utc>> {
        self.limits
            .expires_in_days
            .filter(|d| *d > 0)
            .map(|d| self.created_at + chrono::Duration::days(d))
    }

    pub fn is_expired(&self) -> bool {
        match self.effective_expiry() {
            Some(exp) => Utc::now() > exp,
            None => false,
        }
    }
}

/// One row per completed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiLog {
    pub request_id: Uuid,
    pub api_key_id: Option<Uuid>,
    pub credential_id: Option<String>,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub status_code: u16,
    pub duration_ms: u64,
    pub path: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

/// Rolling request/cost counters for a window (used by quota enforcement).
#[derive(Debug, Clone, Default)]
pub struct UsageCounters {
    pub request_count: u64,
    pub cost: f64,
}

/// `(hash -> value, modelFamily, expiresAt)` TTL cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingSignatureEntry {
    pub hash: String,
    pub value: String,
    pub model_family: String,
    pub expires_at: DateTime<Utc>,
}

/// `(alias, provider) -> targetModel` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelAlias {
    pub alias: String,
    pub provider: Provider,
    pub target_model: String,
    pub priority: i32,
    pub active: bool,
}

/// Pricing source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingSource {
    Default,
    Remote,
    Manual,
}

/// `(modelName -> {...})` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPricing {
    pub model_name: String,
    pub input_price_per_m: f64,
    pub output_price_per_m: f64,
    pub provider: Provider,
    pub source: PricingSource,
    pub is_custom: bool,
}

impl ModelPricing {
    /// `source='manual' or isCustom=1` suppresses remote overwrites.
    pub fn suppresses_remote_overwrite(&self) -> bool {
        self.source == PricingSource::Manual || self.is_custom
    }
}

/// Errors surfaced by store implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("unique constraint violated: {0}")]
    Conflict(String),
    #[error("store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The persistent store interface.
#[async_trait]
pub trait Store: Send + Sync {
    // ---- Credentials (C2 backing) ----
    async fn insert_credential(&self, credential: Credential) -> StoreResult<()>;
    async fn update_credential(&self, credential: Credential) -> StoreResult<()>;
    async fn delete_credential(&self, provider: Provider, id: &str) -> StoreResult<()>;
    async fn find_credential(&self, provider: Provider, id: &str) -> StoreResult<Credential>;
    async fn find_credential_by_name(
        &self,
        provider: Provider,
        name: &str,
    ) -> StoreResult<Credential>;
    /// Ordered `errorCount ASC, updatedAt DESC`.
    async fn list_credentials(&self, provider: Provider) -> StoreResult<Vec<Credential>>;
    async fn list_active_credentials(&self, provider: Provider) -> StoreResult<Vec<Credential>>;
    async fn increment_use_count(&self, provider: Provider, id: &str) -> StoreResult<()>;
    async fn record_error_count(
        &self,
        provider: Provider,
        id: &str,
        message: &str,
    ) -> StoreResult<u32>;
    async fn reset_error_count(&self, provider: Provider, id: &str) -> StoreResult<()>;
    async fn update_quota(
        &self,
        provider: Provider,
        id: &str,
        quota: std::collections::HashMap<String, QuotaEntry>,
    ) -> StoreResult<()>;

    // ---- Error (quarantine) table ----
    async fn move_to_error(
        &self,
        provider: Provider,
        id: &str,
        message: &str,
    ) -> StoreResult<ErrorCredential>;
    async fn list_error_credentials(&self, provider: Provider) -> StoreResult<Vec<ErrorCredential>>;
    async fn restore_from_error(
        &self,
        provider: Provider,
        error_id: &str,
        new_access_secret: String,
        new_refresh_secret: Option<String>,
    ) -> StoreResult<Credential>;

    // ---- Health (C4 backing) ----
    async fn get_health(&self, provider: Provider, credential_id: &str) -> StoreResult<Health>;
    async fn upsert_health(&self, health: Health) -> StoreResult<()>;

    // ---- Token bucket (C4 backing) ----
    async fn get_bucket(&self, provider: Provider, credential_id: &str) -> StoreResult<TokenBucket>;
    async fn upsert_bucket(&self, bucket: TokenBucket) -> StoreResult<()>;

    // ---- API keys ----
    async fn insert_api_key(&self, key: ApiKey) -> StoreResult<()>;
    async fn find_api_key_by_hash(&self, key_hash: &str) -> StoreResult<ApiKey>;
    async fn set_api_key_active(&self, id: Uuid, active: bool) -> StoreResult<()>;
    async fn touch_api_key_last_used(&self, id: Uuid) -> StoreResult<()>;

    // ---- API logs ----
    async fn insert_api_log(&self, log: ApiLog) -> StoreResult<()>;
    /// Rolling counters for the given API key since `since`, used for
    /// daily/monthly/total quota enforcement.
    async fn usage_since(&self, api_key_id: Uuid, since: DateTime<Utc>) -> StoreResult<UsageCounters>;
    async fn delete_logs_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    // ---- Thinking-signature cache ----
    async fn get_thinking_signature(&self, hash: &str) -> StoreResult<Option<ThinkingSignatureEntry>>;
    async fn put_thinking_signature(&self, entry: ThinkingSignatureEntry) -> StoreResult<()>;

    // ---- Model aliases / pricing ----
    async fn list_model_aliases(&self, alias: &str, provider: Provider) -> StoreResult<Vec<ModelAlias>>;
    async fn upsert_model_alias(&self, row: ModelAlias) -> StoreResult<()>;
    async fn get_model_pricing(&self, model_name: &str) -> StoreResult<Option<ModelPricing>>;
    async fn upsert_model_pricing(&self, row: ModelPricing) -> StoreResult<()>;

    // ---- Settings (C11 backing) ----
    async fn load_settings(&self) -> StoreResult<Option<GlobalSettings>>;
    async fn save_settings(&self, settings: &GlobalSettings) -> StoreResult<()>;

    /// Cheapest possible round trip to the backing store, used by the
    /// gateway's `/health` endpoint to report real liveness.
    async fn ping(&self) -> StoreResult<()>;
}
