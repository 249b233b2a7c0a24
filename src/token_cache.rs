//! Access token cache with single-flight refresh.
//!
//! Tokens are cached per service-account identity until `expiry - refresh_margin`.
//! The margin never exceeds half of a token's lifetime, so short-lived tokens are
//! still reused for part of their validity window.
//! When a token needs refreshing, the first caller performs the exchange while
//! holding the identity's refresh lock; concurrent callers queue on the same lock
//! and pick up the token it stored instead of starting their own exchange.
//!
//! A refresh that fails, or whose future is dropped, stores nothing.

use crate::credentials::{AccessToken, TokenIssuer};
use crate::transport::HttpTransport;
use crate::Result;
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::debug;

#[derive(Clone)]
struct CachedToken {
    token: AccessToken,
    /// Point after which callers refresh instead of reusing
    refresh_at: Instant,
}

#[derive(Default)]
struct TokenSlot {
    current: RwLock<Option<CachedToken>>,
    refresh: Mutex<()>,
}

/// Shared, read-mostly token cache keyed by service-account identity
pub struct TokenCache {
    slots: DashMap<String, Arc<TokenSlot>>,
    refresh_margin: Duration,
    refreshes: AtomicU64,
}

impl TokenCache {
    pub fn new(refresh_margin: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            refresh_margin,
            refreshes: AtomicU64::new(0),
        }
    }

    /// Return a token for `identity` that is valid beyond the refresh margin,
    /// running `refresh` at most once across concurrent callers when none is.
    pub async fn get_or_refresh<F, Fut>(&self, identity: &str, refresh: F) -> Result<AccessToken>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AccessToken>>,
    {
        let slot = Arc::clone(self.slots.entry(identity.to_string()).or_default().value());

        if let Some(token) = self.usable(&slot).await {
            return Ok(token);
        }

        let _refresh_guard = slot.refresh.lock().await;

        if let Some(token) = self.usable(&slot).await {
            debug!("Reusing token refreshed by a concurrent request for {}", identity);
            return Ok(token);
        }

        let requested_at = Instant::now();
        let token = refresh().await?;
        let lifetime = token.lifetime();
        let margin = self.refresh_margin.min(lifetime / 2);

        *slot.current.write().await = Some(CachedToken {
            token: token.clone(),
            refresh_at: requested_at + (lifetime - margin),
        });
        self.refreshes.fetch_add(1, Ordering::Relaxed);

        debug!(
            "Cached access token for {} (valid for {:?})",
            identity,
            token.lifetime()
        );
        Ok(token)
    }

    /// Drop the cached token for `identity`
    pub async fn invalidate(&self, identity: &str) {
        if let Some(slot) = self.slots.get(identity).map(|s| Arc::clone(s.value())) {
            *slot.current.write().await = None;
        }
    }

    /// Number of successful refreshes performed
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    async fn usable(&self, slot: &TokenSlot) -> Option<AccessToken> {
        let current = slot.current.read().await;
        current
            .as_ref()
            .filter(|cached| Instant::now() < cached.refresh_at)
            .map(|cached| cached.token.clone())
    }
}

/// Supplies the bearer token for each request, through the cache when enabled
pub struct TokenProvider<T> {
    issuer: TokenIssuer<T>,
    cache: Option<TokenCache>,
}

impl<T: HttpTransport> TokenProvider<T> {
    /// Exchange a fresh token on every call
    pub fn uncached(issuer: TokenIssuer<T>) -> Self {
        Self {
            issuer,
            cache: None,
        }
    }

    /// Reuse tokens until `refresh_margin` before they expire
    pub fn cached(issuer: TokenIssuer<T>, refresh_margin: Duration) -> Self {
        Self {
            issuer,
            cache: Some(TokenCache::new(refresh_margin)),
        }
    }

    pub async fn access_token(&self) -> Result<AccessToken> {
        match &self.cache {
            Some(cache) => {
                cache
                    .get_or_refresh(self.issuer.identity(), || self.issuer.issue_access_token())
                    .await
            }
            None => self.issuer.issue_access_token().await,
        }
    }

    /// Forget the cached token so the next request exchanges a new one
    pub async fn invalidate(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate(self.issuer.identity()).await;
        }
    }

    pub fn cache(&self) -> Option<&TokenCache> {
        self.cache.as_ref()
    }
}
