//! Health & rate tracker.
//!
//! Tracks a 0-100 health score and a token bucket per `(provider,
//! credential)` pair, upserted on every observation (success, failure, or
//! rate-limit) with a neutral baseline for credentials never yet observed.

use std::sync::Arc;

use chrono::Utc;

use crate::store::{Health, Provider, Store, StoreResult, TokenBucket};

pub struct HealthTracker {
    store: Arc<dyn Store>,
}

impl HealthTracker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn get(&self, provider: Provider, credential_id: &str) -> StoreResult<Health> {
        self.store.get_health(provider, credential_id).await
    }

    /// Success: small bonus, capped at 100; consecutive-failure counter resets.
    pub async fn record_success(&self, provider: Provider, credential_id: &str, bonus: f64) -> StoreResult<Health> {
        let mut health = self.store.get_health(provider, credential_id).await?;
        health.score = (health.score + bonus).min(100.0);
        health.consecutive_failures = 0;
        health.last_success_at = Some(Utc::now());
        self.store.upsert_health(health.clone()).await?;
        Ok(health)
    }

    /// Failure: larger penalty, floored at 0; consecutive-failure counter increments.
    pub async fn record_failure(
        &self,
        provider: Provider,
        credential_id: &str,
        penalty: f64,
        message: impl Into<String>,
    ) -> StoreResult<Health> {
        let mut health = self.store.get_health(provider, credential_id).await?;
        health.score = (health.score - penalty).max(0.0);
        health.consecutive_failures += 1;
        health.last_failure_at = Some(Utc::now());
        health.last_error_message = Some(message.into());
        self.store.upsert_health(health.clone()).await?;
        Ok(health)
    }

    /// Rate-limit observation: a smaller penalty than a hard failure, floored at 0.
    /// Does not reset or increment the consecutive-failure counter, since the
    /// credential itself is not unhealthy — it is being throttled.
    pub async fn record_rate_limit(
        &self,
        provider: Provider,
        credential_id: &str,
        penalty: f64,
    ) -> StoreResult<Health> {
        let mut health = self.store.get_health(provider, credential_id).await?;
        health.score = (health.score - penalty).max(0.0);
        self.store.upsert_health(health.clone()).await?;
        Ok(health)
    }

    pub async fn get_bucket(&self, provider: Provider, credential_id: &str) -> StoreResult<TokenBucket> {
        self.store.get_bucket(provider, credential_id).await
    }

    /// Tokens available right now, accounting for wall-time elapsed since
    /// `last_updated` — not persisted by itself.
    pub fn effective_tokens(bucket: &TokenBucket, max: f64, regen_per_minute: f64) -> f64 {
        let elapsed_minutes = (Utc::now() - bucket.last_updated).num_milliseconds() as f64 / 60_000.0;
        (bucket.tokens + elapsed_minutes.max(0.0) * regen_per_minute).min(max)
    }

    /// `consume(n)`: succeeds iff effective tokens ≥ n, debits and persists;
    /// otherwise returns `(false, currentTokens)` without persisting.
    pub async fn consume(
        &self,
        provider: Provider,
        credential_id: &str,
        n: f64,
        max: f64,
        regen_per_minute: f64,
    ) -> StoreResult<(bool, f64)> {
        let bucket = self.store.get_bucket(provider, credential_id).await?;
        let effective = Self::effective_tokens(&bucket, max, regen_per_minute);
        if effective < n {
            return Ok((false, effective));
        }
        let updated = TokenBucket {
            provider,
            credential_id: credential_id.to_string(),
            tokens: effective - n,
            last_updated: Utc::now(),
        };
        self.store.upsert_bucket(updated).await?;
        Ok((true, effective - n))
    }

    /// `refund(n)`: restores optimistic consumption after an observed 429.
    pub async fn refund(
        &self,
        provider: Provider,
        credential_id: &str,
        n: f64,
        max: f64,
        regen_per_minute: f64,
    ) -> StoreResult<f64> {
        let bucket = self.store.get_bucket(provider, credential_id).await?;
        let effective = Self::effective_tokens(&bucket, max, regen_per_minute);
        let restored = (effective + n).min(max);
        let updated = TokenBucket {
            provider,
            credential_id: credential_id.to_string(),
            tokens: restored,
            last_updated: Utc::now(),
        };
        self.store.upsert_bucket(updated).await?;
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn success_bonus_caps_at_100() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new().await.unwrap());
        let tracker = HealthTracker::new(store);
        for _ in 0..50 {
            tracker.record_success(Provider::Kiro, "c1", 1.0).await.unwrap();
        }
        let health = tracker.get(Provider::Kiro, "c1").await.unwrap();
        assert_eq!(health.score, 100.0);
    }

    #[tokio::test]
    async fn failure_penalty_floors_at_0() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new().await.unwrap());
        let tracker = HealthTracker::new(store);
        for _ in 0..10 {
            tracker
                .record_failure(Provider::Kiro, "c1", 20.0, "boom")
                .await
                .unwrap();
        }
        let health = tracker.get(Provider::Kiro, "c1").await.unwrap();
        assert_eq!(health.score, 0.0);
        assert_eq!(health.consecutive_failures, 10);
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new().await.unwrap());
        let tracker = HealthTracker::new(store);
        tracker.record_failure(Provider::Kiro, "c1", 20.0, "x").await.unwrap();
        tracker.record_failure(Provider::Kiro, "c1", 20.0, "x").await.unwrap();
        let health = tracker.record_success(Provider::Kiro, "c1", 1.0).await.unwrap();
        assert_eq!(health.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn consume_fails_without_persisting_when_insufficient() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new().await.unwrap());
        let tracker = HealthTracker::new(store);
        let (ok, remaining) = tracker.consume(Provider::Kiro, "c1", 1000.0, 50.0, 6.0).await.unwrap();
        assert!(!ok);
        assert_eq!(remaining, 50.0);
    }

    #[tokio::test]
    async fn consume_then_refund_round_trips() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new().await.unwrap());
        let tracker = HealthTracker::new(store);
        let (ok, remaining) = tracker.consume(Provider::Kiro, "c1", 10.0, 50.0, 6.0).await.unwrap();
        assert!(ok);
        assert_eq!(remaining, 40.0);
        let restored = tracker.refund(Provider::Kiro, "c1", 10.0, 50.0, 6.0).await.unwrap();
        assert_eq!(restored, 50.0);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;

    proptest! {
        /// Bucket non-negativity: `effective_tokens` never leaves `[0, max]`
        /// regardless of starting balance, regen rate, or elapsed time.
        #[test]
        fn effective_tokens_stays_within_bucket_bounds(
            start_tokens in 0.0f64..500.0,
            max in 1.0f64..500.0,
            regen_per_minute in 0.0f64..100.0,
            elapsed_minutes in 0.0f64..1_000.0,
        ) {
            let bucket = TokenBucket {
                provider: Provider::Kiro,
                credential_id: "c1".to_string(),
                tokens: start_tokens.min(max),
                last_updated: Utc::now() - ChronoDuration::milliseconds((elapsed_minutes * 60_000.0) as i64),
            };
            let effective = HealthTracker::effective_tokens(&bucket, max, regen_per_minute);
            prop_assert!(effective >= 0.0);
            prop_assert!(effective <= max);
        }
    }
}
