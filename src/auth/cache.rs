use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::credential::AccessToken;
use crate::error::{GambitError, Result};

/// Performs the broker's raw token issuance call. Implemented by each
/// adapter; issuance goes through the broker's rate limiter like every
/// other outbound call.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue_token(&self) -> Result<AccessToken>;
}

/// Shared handle to an in-flight refresh. The output is stringly typed
/// because shared futures hand every waiter a clone of the result.
type FlightOutput = std::result::Result<AccessToken, String>;
type Flight = Shared<BoxFuture<'static, FlightOutput>>;

#[derive(Default)]
struct TokenSlot {
    token: Option<AccessToken>,
    inflight: Option<Flight>,
}

type SlotKey = (String, String);

/// Owns one access token per (broker, account) pair and refreshes it
/// before expiry. Concurrent callers needing a refresh join a single
/// in-flight issuance; a failed issuance invalidates any stale token and
/// fails every waiter.
pub struct CredentialCache {
    refresh_margin: ChronoDuration,
    slots: DashMap<SlotKey, Arc<Mutex<TokenSlot>>>,
    issuers: DashMap<SlotKey, Arc<dyn TokenIssuer>>,
}

impl CredentialCache {
    pub fn new(refresh_margin_secs: i64) -> Self {
        Self {
            refresh_margin: ChronoDuration::seconds(refresh_margin_secs),
            slots: DashMap::new(),
            issuers: DashMap::new(),
        }
    }

    /// Register the issuance path for one (broker, account) pair.
    pub fn register(&self, broker_id: &str, account_id: &str, issuer: Arc<dyn TokenIssuer>) {
        self.issuers
            .insert(slot_key(broker_id, account_id), issuer);
    }

    /// Returns a currently valid token, transparently refreshing when the
    /// cached one is missing or inside the safety margin of expiry.
    pub async fn get_token(&self, broker_id: &str, account_id: &str) -> Result<String> {
        let key = slot_key(broker_id, account_id);
        let slot = self
            .slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(TokenSlot::default())))
            .clone();

        let flight = {
            let mut guard = slot.lock().await;

            if let Some(token) = &guard.token {
                if !token.needs_refresh(self.refresh_margin) {
                    return Ok(token.access_token.clone());
                }
                debug!(
                    broker_id,
                    account_id,
                    remaining_secs = token.remaining().num_seconds(),
                    "cached token inside refresh margin"
                );
            }

            if let Some(flight) = &guard.inflight {
                flight.clone()
            } else {
                let issuer = self
                    .issuers
                    .get(&key)
                    .map(|entry| entry.value().clone())
                    .ok_or_else(|| {
                        GambitError::Auth(format!(
                            "no token issuer registered for {broker_id}/{account_id}"
                        ))
                    })?;

                let slot_for_flight = slot.clone();
                let broker = broker_id.to_string();
                let flight: Flight = async move {
                    let outcome = issuer.issue_token().await.map_err(|e| e.to_string());
                    let mut guard = slot_for_flight.lock().await;
                    guard.inflight = None;
                    match &outcome {
                        Ok(token) => {
                            debug!(
                                broker_id = %broker,
                                expires_at = %token.expires_at,
                                "access token refreshed"
                            );
                            guard.token = Some(token.clone());
                        }
                        Err(reason) => {
                            warn!(broker_id = %broker, %reason, "token refresh failed");
                            guard.token = None;
                        }
                    }
                    outcome
                }
                .boxed()
                .shared();

                guard.inflight = Some(flight.clone());
                flight
            }
        };

        flight
            .await
            .map(|token| token.access_token)
            .map_err(GambitError::Auth)
    }

    /// Drop the cached token, forcing the next `get_token` to refresh.
    /// Used by adapters after an auth-rejection response.
    pub async fn invalidate(&self, broker_id: &str, account_id: &str) {
        if let Some(slot) = self.slots.get(&slot_key(broker_id, account_id)) {
            let slot = slot.value().clone();
            slot.lock().await.token = None;
            debug!(broker_id, account_id, "cached token invalidated");
        }
    }
}

fn slot_key(broker_id: &str, account_id: &str) -> SlotKey {
    (broker_id.to_string(), account_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct CountingIssuer {
        calls: AtomicU32,
        fail: bool,
        delay_ms: u64,
        ttl_secs: i64,
    }

    impl CountingIssuer {
        fn new(ttl_secs: i64) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail: false,
                delay_ms: 20,
                ttl_secs,
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail: true,
                delay_ms: 20,
                ttl_secs: 3600,
            }
        }
    }

    #[async_trait]
    impl TokenIssuer for CountingIssuer {
        async fn issue_token(&self) -> Result<AccessToken> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            if self.fail {
                return Err(GambitError::Auth("issuer down".to_string()));
            }
            Ok(AccessToken::new(
                format!("token-{call}"),
                Utc::now() + ChronoDuration::seconds(self.ttl_secs),
            ))
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_issuance() {
        let cache = Arc::new(CredentialCache::new(60));
        let issuer = Arc::new(CountingIssuer::new(3600));
        cache.register("kis", "acct", issuer.clone());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(
                async move { cache.get_token("kis", "acct").await },
            ));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "token-1");
        }
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_valid_token_served_without_issuance() {
        let cache = CredentialCache::new(60);
        let issuer = Arc::new(CountingIssuer::new(3600));
        cache.register("kis", "acct", issuer.clone());

        cache.get_token("kis", "acct").await.unwrap();
        cache.get_token("kis", "acct").await.unwrap();
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_token_inside_margin_is_refreshed() {
        let cache = CredentialCache::new(60);
        // 30s of validity is inside the 60s margin, so every call refreshes.
        let issuer = Arc::new(CountingIssuer::new(30));
        cache.register("kis", "acct", issuer.clone());

        let first = cache.get_token("kis", "acct").await.unwrap();
        let second = cache.get_token("kis", "acct").await.unwrap();
        assert_eq!(first, "token-1");
        assert_eq!(second, "token-2");
    }

    #[tokio::test]
    async fn test_refresh_failure_fails_all_waiters() {
        let cache = Arc::new(CredentialCache::new(60));
        let issuer = Arc::new(CountingIssuer::failing());
        cache.register("kis", "acct", issuer.clone());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            handles.push(tokio::spawn(
                async move { cache.get_token("kis", "acct").await },
            ));
        }

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(err.is_auth(), "expected auth error, got {err}");
        }
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reissue() {
        let cache = CredentialCache::new(60);
        let issuer = Arc::new(CountingIssuer::new(3600));
        cache.register("kis", "acct", issuer.clone());

        assert_eq!(cache.get_token("kis", "acct").await.unwrap(), "token-1");
        cache.invalidate("kis", "acct").await;
        assert_eq!(cache.get_token("kis", "acct").await.unwrap(), "token-2");
    }

    #[tokio::test]
    async fn test_unregistered_pair_is_auth_error() {
        let cache = CredentialCache::new(60);
        let err = cache.get_token("kis", "nobody").await.unwrap_err();
        assert!(err.is_auth());
    }
}
