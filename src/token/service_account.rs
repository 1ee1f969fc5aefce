//! Vertex service-account JWT-bearer token provider.
//!
//! Grounded directly on `siumai`'s `auth/service_account.rs`
//! (`ServiceAccountTokenProvider`, JWT claims shape, cache-then-exchange
//! flow). Adapted from siumai's blocking `reqwest::blocking::Client` +
//! `Mutex`/`Condvar` thundering-herd guard to this gateway's async
//! `reqwest::Client` + `tokio::sync::Mutex`/`Notify`, and the cache safety
//! window is tightened to a 60-second safety margin.

use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};

use super::TokenError;

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
/// Safety window before expiry at which a cached token is no longer served.
const EXPIRY_SAFETY_WINDOW_SECS: i64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAccountCredentials {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub token_uri: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl ServiceAccountCredentials {
    pub fn from_json(json: &str) -> Result<Self, TokenError> {
        Ok(serde_json::from_str(json)?)
    }

    fn scope_string(&self) -> String {
        if self.scopes.is_empty() {
            DEFAULT_SCOPE.to_string()
        } else {
            self.scopes.join(" ")
        }
    }

    fn token_uri(&self) -> String {
        self.token_uri.clone().unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
struct Claims {
    iss: String,
    scope: String,
    aud: String,
    exp: i64,
    iat: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    exp_unix: i64,
}

/// Per-credential token cache with a single-flight refresh guard.
pub struct ServiceAccountTokenProvider {
    creds: ServiceAccountCredentials,
    http: Client,
    cache: Mutex<Option<CachedToken>>,
    refreshing: Mutex<bool>,
    notify: Notify,
}

impl ServiceAccountTokenProvider {
    pub fn new(creds: ServiceAccountCredentials, http: Client) -> Self {
        Self {
            creds,
            http,
            cache: Mutex::new(None),
            refreshing: Mutex::new(false),
            notify: Notify::new(),
        }
    }

    async fn cached(&self) -> Option<(String, DateTime<Utc>)> {
        let now = Utc::now().timestamp();
        let guard = self.cache.lock().await;
        guard.as_ref().and_then(|ct| {
            if ct.exp_unix - EXPIRY_SAFETY_WINDOW_SECS > now {
                Some((
                    ct.token.clone(),
                    DateTime::from_timestamp(ct.exp_unix, 0).unwrap_or_else(Utc::now),
                ))
            } else {
                None
            }
        })
    }

    /// Returns `(access_token, expiry)`, refreshing if the cache is stale.
    /// Concurrent callers during a refresh wait on the in-flight result
    /// rather than each issuing their own token exchange.
    pub async fn token(&self) -> Result<(String, DateTime<Utc>), TokenError> {
        if let Some(cached) = self.cached().await {
            return Ok(cached);
        }

        loop {
            let mut refreshing = self.refreshing.lock().await;
            if !*refreshing {
                *refreshing = true;
                drop(refreshing);
                let result = self.fetch_new_token().await;
                *self.refreshing.lock().await = false;
                self.notify.notify_waiters();
                return result;
            }
            drop(refreshing);
            self.notify.notified().await;
            if let Some(cached) = self.cached().await {
                return Ok(cached);
            }
        }
    }

    async fn fetch_new_token(&self) -> Result<(String, DateTime<Utc>), TokenError> {
        let now = Utc::now().timestamp();
        let aud = self.creds.token_uri();
        let claims = Claims {
            iss: self.creds.client_email.clone(),
            scope: self.creds.scope_string(),
            aud: aud.clone(),
            iat: now,
            exp: now + 3600,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.typ = Some("JWT".to_string());
        let key = EncodingKey::from_rsa_pem(self.creds.private_key.as_bytes())?;
        let assertion = encode(&header, &claims, &key)?;

        let resp = self
            .http
            .post(&aud)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(TokenError::UpstreamRejected(body));
        }
        let parsed: TokenResponse = serde_json::from_str(&body)?;
        let exp_unix = now + parsed.expires_in;

        {
            let mut guard = self.cache.lock().await;
            *guard = Some(CachedToken {
                token: parsed.access_token.clone(),
                exp_unix,
            });
        }

        Ok((
            parsed.access_token,
            DateTime::from_timestamp(exp_unix, 0).unwrap_or_else(Utc::now),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_string_defaults_to_cloud_platform() {
        let creds = ServiceAccountCredentials {
            client_email: "svc@example.iam.gserviceaccount.com".into(),
            private_key: "irrelevant".into(),
            token_uri: None,
            scopes: vec![],
        };
        assert_eq!(creds.scope_string(), DEFAULT_SCOPE);
    }

    #[test]
    fn token_uri_defaults_to_google_oauth() {
        let creds = ServiceAccountCredentials {
            client_email: "svc@example.iam.gserviceaccount.com".into(),
            private_key: "irrelevant".into(),
            token_uri: None,
            scopes: vec![],
        };
        assert_eq!(creds.token_uri(), DEFAULT_TOKEN_URI);
    }
}
