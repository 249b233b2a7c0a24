//! Edge Cache Module
//!
//! In-memory response cache driven by the [`CacheDirectives`] attached to outbound
//! requests. Entries are keyed by the directive cache key, live for the TTL the
//! directives assign to the response's status class, and carry their cache tags
//! so a whole asset category can be purged at once.
//!
//! Requests without directives, non-GET/HEAD requests and range requests bypass
//! the cache. A successful write to a cached key drops the stored entry.

use crate::config::EdgeCacheConfig;
use crate::proxy_request::CacheDirectives;
use crate::transport::{collect_body, full_body, HttpTransport, ProxyBody};
use crate::Result;
use bytes::Bytes;
use dashmap::DashMap;
use http_body_util::Full;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, RANGE};
use hyper::{Method, Request, Response, StatusCode};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Response header reporting the cache outcome
pub const EDGE_CACHE_HEADER: &str = "x-edge-cache";

#[derive(Debug, Clone)]
struct CachedResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    tags: Vec<String>,
    expires_at: Instant,
    generation: u64,
}

/// Edge cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Keyed response store with per-entry expiry and tag purging
pub struct EdgeCache {
    entries: DashMap<String, CachedResponse>,
    /// Insertion order as (key, generation); stale pairs are skipped on eviction
    order: Mutex<VecDeque<(String, u64)>>,
    max_entries: usize,
    max_object_size: u64,
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl EdgeCache {
    pub fn new(max_entries: usize, max_object_size: u64) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            max_entries,
            max_object_size,
            generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &EdgeCacheConfig) -> Self {
        Self::new(config.max_entries, config.max_object_size)
    }

    /// Largest body the cache will store
    pub fn max_object_size(&self) -> u64 {
        self.max_object_size
    }

    /// Look up an unexpired entry, dropping it if it has expired
    pub fn get(&self, key: &str) -> Option<(StatusCode, HeaderMap, Bytes)> {
        let now = Instant::now();
        let hit = match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => Some((
                entry.status,
                entry.headers.clone(),
                entry.body.clone(),
            )),
            Some(_) => None,
            None => None,
        };

        match hit {
            Some(found) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Edge cache hit for key: {}", key);
                Some(found)
            }
            None => {
                self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!("Edge cache miss for key: {}", key);
                None
            }
        }
    }

    /// Store a response for `ttl`; zero TTLs and oversized bodies are ignored.
    /// Returns whether the entry was stored.
    pub fn put(
        &self,
        key: &str,
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        ttl: Duration,
        tags: Vec<String>,
    ) -> bool {
        if ttl.is_zero() || body.len() as u64 > self.max_object_size || self.max_entries == 0 {
            return false;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            key.to_string(),
            CachedResponse {
                status,
                headers,
                body,
                tags,
                expires_at: Instant::now() + ttl,
                generation,
            },
        );

        let mut order = match self.order.lock() {
            Ok(order) => order,
            Err(poisoned) => poisoned.into_inner(),
        };
        order.push_back((key.to_string(), generation));

        while self.entries.len() > self.max_entries {
            let Some((victim, victim_generation)) = order.pop_front() else {
                break;
            };
            let removed = self
                .entries
                .remove_if(&victim, |_, entry| entry.generation == victim_generation);
            if removed.is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!("Evicted oldest edge cache entry: {}", victim);
            }
        }

        // Drop bookkeeping for keys that were replaced or purged
        if order.len() > self.max_entries.saturating_mul(2) {
            order.retain(|(k, g)| {
                self.entries
                    .get(k)
                    .is_some_and(|entry| entry.generation == *g)
            });
        }

        debug!("Stored edge cache entry: {} (ttl: {:?})", key, ttl);
        true
    }

    /// Remove one entry
    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every entry carrying `tag`; returns the number removed
    pub fn purge_tag(&self, tag: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !entry.tags.iter().any(|t| t == tag));
        let purged = before.saturating_sub(self.entries.len());
        info!("Purged {} edge cache entries tagged {}", purged, tag);
        purged
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> EdgeCacheStats {
        EdgeCacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Transport decorator that serves and fills the [`EdgeCache`]; without a cache
/// every request passes straight through.
pub struct CachingTransport<T> {
    inner: T,
    cache: Option<Arc<EdgeCache>>,
}

impl<T: HttpTransport> CachingTransport<T> {
    pub fn new(inner: T, cache: Arc<EdgeCache>) -> Self {
        Self {
            inner,
            cache: Some(cache),
        }
    }

    pub fn passthrough(inner: T) -> Self {
        Self { inner, cache: None }
    }

    pub fn cache(&self) -> Option<&Arc<EdgeCache>> {
        self.cache.as_ref()
    }

    async fn fetch_and_fill(
        &self,
        cache: &EdgeCache,
        request: Request<Full<Bytes>>,
        directives: CacheDirectives,
        is_head: bool,
    ) -> Result<Response<ProxyBody>> {
        let response = self.inner.send(request).await?;
        let status = response.status();

        let ttl = directives.ttl_for_status(status.as_u16()).unwrap_or(0);
        let declared_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let storable = !is_head
            && ttl > 0
            && declared_length.is_some_and(|len| len <= cache.max_object_size());

        if !storable {
            return Ok(response);
        }

        let (mut parts, body) = response.into_parts();
        let body = collect_body(body).await?;

        cache.put(
            &directives.cache_key,
            parts.status,
            parts.headers.clone(),
            body.clone(),
            Duration::from_secs(u64::from(ttl)),
            directives.cache_tags,
        );

        parts
            .headers
            .insert(EDGE_CACHE_HEADER, HeaderValue::from_static("MISS"));
        Ok(Response::from_parts(parts, full_body(body)))
    }
}

fn is_read(method: &Method) -> bool {
    method == Method::GET || method == Method::HEAD
}

fn cache_eligible(request: &Request<Full<Bytes>>) -> bool {
    is_read(request.method()) && !request.headers().contains_key(RANGE)
}

impl<T: HttpTransport> HttpTransport for CachingTransport<T> {
    async fn send(&self, request: Request<Full<Bytes>>) -> Result<Response<ProxyBody>> {
        let (cache, directives) = match (&self.cache, request.extensions().get::<CacheDirectives>()) {
            (Some(cache), Some(directives)) => (Arc::clone(cache), directives.clone()),
            _ => return self.inner.send(request).await,
        };

        if !cache_eligible(&request) {
            let invalidates = !is_read(request.method());
            let response = self.inner.send(request).await?;
            // A successful write makes the stored copy stale
            if invalidates && response.status().is_success() && cache.remove(&directives.cache_key) {
                debug!("Dropped edge cache entry {} after write", directives.cache_key);
            }
            return Ok(response);
        }
        let is_head = request.method() == Method::HEAD;

        if let Some((status, headers, body)) = cache.get(&directives.cache_key) {
            let mut response = Response::new(full_body(if is_head { Bytes::new() } else { body }));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            response
                .headers_mut()
                .insert(EDGE_CACHE_HEADER, HeaderValue::from_static("HIT"));
            return Ok(response);
        }

        self.fetch_and_fill(&cache, request, directives, is_head)
            .await
    }
}
