//! Token manager (C3): per-provider auth-method matrix, proactive/reactive
//! refresh, and the Vertex service-account JWT-bearer cache.
//!
//! `social`/`builder-id`/`IdC` refresh shapes and their retry posture are
//! grounded on `kiro.rs`'s `kiro-provider.rs` (401/403/402 classification,
//! region-templated endpoints). The service-account flow is grounded on
//! `siumai`'s `service_account.rs` (`ServiceAccountTokenProvider`), adapted
//! from its blocking `Mutex`+`Condvar` thundering-herd guard to the async
//! equivalent (`tokio::sync::Mutex` + `tokio::sync::Notify`) since this
//! gateway runs entirely on the async executor.

mod service_account;

pub use service_account::{ServiceAccountCredentials, ServiceAccountTokenProvider};

use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::store::{AuxAuthFields, Credential, Provider};

/// Auth-method matrix row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Social,
    BuilderId,
    IdC,
    Google,
    ServiceAccount,
}

impl AuthMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "social" => Some(AuthMethod::Social),
            "builder-id" => Some(AuthMethod::BuilderId),
            "idc" | "IdC" => Some(AuthMethod::IdC),
            "google" => Some(AuthMethod::Google),
            "service-account" => Some(AuthMethod::ServiceAccount),
            _ => None,
        }
    }

    /// Default auth method implied by the provider when the credential's
    /// `aux.auth_method` is unset.
    pub fn default_for(provider: Provider) -> Self {
        match provider {
            Provider::Kiro => AuthMethod::Social,
            Provider::Gemini => AuthMethod::Google,
            Provider::Vertex => AuthMethod::ServiceAccount,
            _ => AuthMethod::Social,
        }
    }
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("credential has no refresh secret configured")]
    NoRefreshSecret,
    #[error("credential has no service account json configured")]
    NoServiceAccountJson,
    #[error("refresh request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("refresh endpoint returned an error body: {0}")]
    UpstreamRejected(String),
    #[error("failed to parse service account json: {0}")]
    ServiceAccountJson(#[from] serde_json::Error),
    #[error("jwt signing failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

pub type TokenResult<T> = Result<T, TokenError>;

/// Outcome of a refresh call: the fields to splice back into the credential.
pub struct RefreshOutcome {
    pub access_secret: String,
    pub refresh_secret: Option<String>,
    pub expiry: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct GenericTokenResponse {
    #[serde(alias = "access_token")]
    access_token: Option<String>,
    #[serde(alias = "accessToken")]
    access_token_camel: Option<String>,
    #[serde(alias = "refresh_token")]
    refresh_token: Option<String>,
    #[serde(alias = "refreshToken")]
    refresh_token_camel: Option<String>,
    #[serde(alias = "expires_in")]
    expires_in: Option<i64>,
    #[serde(alias = "expiresIn")]
    expires_in_camel: Option<i64>,
    #[serde(alias = "expires_at")]
    expires_at: Option<DateTime<Utc>>,
    #[serde(alias = "expiresAt")]
    expires_at_camel: Option<DateTime<Utc>>,
}

impl GenericTokenResponse {
    fn access_token(&self) -> Option<&str> {
        self.access_token
            .as_deref()
            .or(self.access_token_camel.as_deref())
    }

    fn refresh_token(&self) -> Option<String> {
        self.refresh_token
            .clone()
            .or_else(|| self.refresh_token_camel.clone())
    }

    fn expiry(&self) -> Option<DateTime<Utc>> {
        if let Some(at) = self.expires_at.or(self.expires_at_camel) {
            return Some(at);
        }
        let secs = self.expires_in.or(self.expires_in_camel)?;
        Some(Utc::now() + Duration::seconds(secs))
    }
}

pub struct TokenManager {
    http: Client,
    /// In-memory cache of service-account token providers, one per
    /// credential id, each owning its own thundering-herd-safe refresh lock
    ///.
    service_accounts: Mutex<HashMap<String, Arc<ServiceAccountTokenProvider>>>,
}

impl TokenManager {
    pub fn new(http: Client) -> Self {
        Self {
            http,
            service_accounts: Mutex::new(HashMap::new()),
        }
    }

    /// `isExpiringSoon(expiresAt, thresholdMinutes)`.
    pub fn is_expiring_soon(expiry: Option<DateTime<Utc>>, threshold_minutes: i64) -> bool {
        match expiry {
            Some(exp) => exp <= Utc::now() + Duration::minutes(threshold_minutes),
            None => false,
        }
    }

    /// Refresh only if expiring within `threshold_minutes`; otherwise return
    /// the credential unchanged.
    pub async fn ensure_valid(
        &self,
        credential: &Credential,
        threshold_minutes: i64,
    ) -> TokenResult<Option<RefreshOutcome>> {
        if !Self::is_expiring_soon(credential.expiry, threshold_minutes) {
            return Ok(None);
        }
        Ok(Some(self.refresh(credential).await?))
    }

    /// Unconditional refresh.
    pub async fn refresh(&self, credential: &Credential) -> TokenResult<RefreshOutcome> {
        let method = credential
            .aux
            .auth_method
            .as_deref()
            .and_then(AuthMethod::parse)
            .unwrap_or_else(|| AuthMethod::default_for(credential.provider));

        match method {
            AuthMethod::Social => self.refresh_social(credential).await,
            AuthMethod::BuilderId | AuthMethod::IdC => self.refresh_oidc(credential, method).await,
            AuthMethod::Google => self.refresh_google(credential).await,
            AuthMethod::ServiceAccount => self.refresh_service_account(credential).await,
        }
    }

    fn region(aux: &AuxAuthFields) -> String {
        aux.region.clone().unwrap_or_else(|| "us-east-1".to_string())
    }

    async fn refresh_social(&self, credential: &Credential) -> TokenResult<RefreshOutcome> {
        let refresh_token = credential
            .refresh_secret
            .as_ref()
            .ok_or(TokenError::NoRefreshSecret)?;
        let region = Self::region(&credential.aux);
        let url = format!("https://oidc.{region}.amazonaws.com/token");

        let resp = self
            .http
            .post(&url)
            .json(&json!({ "refreshToken": refresh_token }))
            .send()
            .await?;
        Self::parse_token_response(resp).await
    }

    async fn refresh_oidc(&self, credential: &Credential, method: AuthMethod) -> TokenResult<RefreshOutcome> {
        let refresh_token = credential
            .refresh_secret
            .as_ref()
            .ok_or(TokenError::NoRefreshSecret)?;
        let region = Self::region(&credential.aux);
        let url = match method {
            AuthMethod::IdC => format!("https://oidc.{region}.amazonaws.com/sso/token"),
            _ => format!("https://oidc.{region}.amazonaws.com/token"),
        };

        let resp = self
            .http
            .post(&url)
            .json(&json!({
                "refreshToken": refresh_token,
                "clientId": credential.aux.client_id,
                "clientSecret": credential.aux.client_secret,
                "grantType": "refresh_token",
            }))
            .send()
            .await?;
        Self::parse_token_response(resp).await
    }

    async fn refresh_google(&self, credential: &Credential) -> TokenResult<RefreshOutcome> {
        let refresh_token = credential
            .refresh_secret
            .as_ref()
            .ok_or(TokenError::NoRefreshSecret)?;
        let resp = self
            .http
            .post("https://oauth2.googleapis.com/token")
            .form(&[
                ("refresh_token", refresh_token.as_str()),
                ("client_id", credential.aux.client_id.as_deref().unwrap_or("")),
                (
                    "client_secret",
                    credential.aux.client_secret.as_deref().unwrap_or(""),
                ),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;
        Self::parse_token_response(resp).await
    }

    async fn parse_token_response(resp: reqwest::Response) -> TokenResult<RefreshOutcome> {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(TokenError::UpstreamRejected(body));
        }
        let parsed: GenericTokenResponse =
            serde_json::from_str(&body).map_err(TokenError::ServiceAccountJson)?;
        let access_secret = parsed
            .access_token()
            .map(str::to_string)
            .ok_or_else(|| TokenError::UpstreamRejected("missing access token in response".into()))?;
        Ok(RefreshOutcome {
            access_secret,
            refresh_secret: parsed.refresh_token(),
            expiry: parsed.expiry(),
        })
    }

    /// Vertex service-account refresh, routed through a per-credential
    /// cached [`ServiceAccountTokenProvider`].
    async fn refresh_service_account(&self, credential: &Credential) -> TokenResult<RefreshOutcome> {
        let json = credential
            .aux
            .service_account_json
            .as_ref()
            .ok_or(TokenError::NoServiceAccountJson)?;

        let provider = {
            let mut cache = self.service_accounts.lock().await;
            if let Some(existing) = cache.get(&credential.id) {
                existing.clone()
            } else {
                let creds = ServiceAccountCredentials::from_json(json)?;
                let provider = Arc::new(ServiceAccountTokenProvider::new(creds, self.http.clone()));
                cache.insert(credential.id.clone(), provider.clone());
                provider
            }
        };

        let (access_token, expiry) = provider.token().await?;
        Ok(RefreshOutcome {
            access_secret: access_token,
            refresh_secret: None,
            expiry: Some(expiry),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiring_soon_threshold() {
        let soon = Utc::now() + Duration::minutes(5);
        assert!(TokenManager::is_expiring_soon(Some(soon), 10));
        let far = Utc::now() + Duration::minutes(30);
        assert!(!TokenManager::is_expiring_soon(Some(far), 10));
        assert!(!TokenManager::is_expiring_soon(None, 10));
    }

    #[test]
    fn auth_method_defaults_by_provider() {
        assert_eq!(AuthMethod::default_for(Provider::Gemini), AuthMethod::Google);
        assert_eq!(AuthMethod::default_for(Provider::Vertex), AuthMethod::ServiceAccount);
        assert_eq!(AuthMethod::default_for(Provider::Kiro), AuthMethod::Social);
    }
}
