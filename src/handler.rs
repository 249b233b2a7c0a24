//! Request Handler Module
//!
//! Runs the per-request pipeline:
//!
//! ```text
//! Start -> TokenIssued -> Classified -> Forwarded -> Finalized
//!   \____________\_____________\____________\______> Failed
//! ```
//!
//! Any failure becomes the uniform HTTP 500 JSON response; nothing from a
//! partially completed pipeline reaches the client.

use crate::asset_rules::{AssetRule, RuleTable};
use crate::config::{Config, DiagnosticsConfig};
use crate::credentials::TokenIssuer;
use crate::edge_cache::{CachingTransport, EdgeCache, EDGE_CACHE_HEADER};
use crate::logging::AccessLogEntry;
use crate::proxy_request::{build_upstream_request, CacheDirectives, UpstreamTarget};
use crate::response::{error_response, finalize};
use crate::service_account::ServiceAccountKey;
use crate::token_cache::TokenProvider;
use crate::transport::{HttpTransport, ProxyBody};
use crate::{ProxyError, Result};
use bytes::Bytes;
use hyper::{Request, Response, StatusCode};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Where a request is in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Start,
    TokenIssued,
    Classified,
    Forwarded,
    Finalized,
    Failed,
}

/// Authenticates, classifies, forwards and post-processes client requests
pub struct RequestHandler<T> {
    tokens: TokenProvider<T>,
    storage: CachingTransport<Arc<T>>,
    rules: Arc<RuleTable>,
    target: UpstreamTarget,
    diagnostics: DiagnosticsConfig,
}

impl<T: HttpTransport> RequestHandler<T> {
    pub fn new(
        tokens: TokenProvider<T>,
        storage: CachingTransport<Arc<T>>,
        rules: Arc<RuleTable>,
        target: UpstreamTarget,
        diagnostics: DiagnosticsConfig,
    ) -> Self {
        Self {
            tokens,
            storage,
            rules,
            target,
            diagnostics,
        }
    }

    /// Wire the pipeline from configuration. `transport` carries both the token
    /// exchange and the storage fetch.
    pub fn from_config(config: &Config, key: ServiceAccountKey, transport: Arc<T>) -> Result<Self> {
        let credentials = &config.credentials;
        let issuer = TokenIssuer::new(Arc::new(key), Arc::clone(&transport))
            .with_scope(credentials.scope.clone())
            .with_exchange_timeout(credentials.exchange_timeout)
            .with_retry(credentials.retry_config());

        let tokens = if credentials.cache_tokens {
            info!(
                "Token cache enabled for {} (refresh margin: {:?})",
                issuer.identity(),
                credentials.refresh_margin
            );
            TokenProvider::cached(issuer, credentials.refresh_margin)
        } else {
            info!("Token cache disabled; exchanging a token per request");
            TokenProvider::uncached(issuer)
        };

        let storage = if config.edge_cache.enabled {
            info!(
                "Edge cache enabled (max_entries: {}, max_object_size: {} bytes)",
                config.edge_cache.max_entries, config.edge_cache.max_object_size
            );
            CachingTransport::new(
                transport,
                Arc::new(EdgeCache::from_config(&config.edge_cache)),
            )
        } else {
            info!("Edge cache disabled");
            CachingTransport::passthrough(transport)
        };

        let target = UpstreamTarget::new(&config.storage.endpoint, &config.storage.bucket)?;

        Ok(Self::new(
            tokens,
            storage,
            Arc::new(config.classifier.rule_table()),
            target,
            config.diagnostics.clone(),
        ))
    }

    pub fn edge_cache(&self) -> Option<&Arc<EdgeCache>> {
        self.storage.cache()
    }

    pub fn token_provider(&self) -> &TokenProvider<T> {
        &self.tokens
    }

    /// Handle one buffered client request; never fails
    pub async fn handle(&self, request: Request<Bytes>) -> Response<ProxyBody> {
        let started = Instant::now();
        let mut entry = AccessLogEntry::begin(request.method().as_str(), request.uri().path());
        let mut progress = Progress::default();

        let result = self.run(&request, &mut progress).await;
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    "Request {} {} failed after {:?}: {}",
                    request.method(),
                    request.uri().path(),
                    progress.stage,
                    e
                );
                progress.stage = PipelineStage::Failed;
                error_response(&e)
            }
        };
        debug!(
            "Request {} finished in stage {:?}",
            entry.request_id, progress.stage
        );

        entry.status = response.status().as_u16();
        entry.duration = started.elapsed();
        if let Some(rule) = progress.rule {
            entry.asset = rule.asset.to_string();
        }
        if let Some(outcome) = progress.edge_cache {
            entry.edge_cache = outcome;
        }
        entry.emit();

        response
    }

    async fn run<'a>(
        &'a self,
        request: &Request<Bytes>,
        progress: &mut Progress<'a>,
    ) -> Result<Response<ProxyBody>> {
        let token = self.tokens.access_token().await?;
        progress.stage = PipelineStage::TokenIssued;

        let rule = self.rules.classify(request.uri().path());
        progress.rule = rule;
        progress.stage = PipelineStage::Classified;

        let upstream_request = build_upstream_request(request, &self.target, &token, rule)?;
        let cache_key = upstream_request
            .extensions()
            .get::<CacheDirectives>()
            .map(|directives| directives.cache_key.clone());
        let upstream_response = self
            .storage
            .send(upstream_request)
            .await
            .map_err(ProxyError::upstream)?;
        progress.stage = PipelineStage::Forwarded;

        if upstream_response.status() == StatusCode::UNAUTHORIZED {
            warn!("Storage rejected the bearer token; dropping the cached token");
            self.tokens.invalidate().await;
        }
        progress.edge_cache = upstream_response
            .headers()
            .get(EDGE_CACHE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let response = finalize(
            upstream_response,
            rule,
            cache_key.as_deref(),
            request.headers(),
            &self.diagnostics,
        );
        progress.stage = PipelineStage::Finalized;
        Ok(response)
    }
}

/// What the pipeline learned about a request, kept for logging on failure too
struct Progress<'a> {
    stage: PipelineStage,
    rule: Option<&'a AssetRule>,
    edge_cache: Option<String>,
}

impl Default for Progress<'_> {
    fn default() -> Self {
        Self {
            stage: PipelineStage::Start,
            rule: None,
            edge_cache: None,
        }
    }
}
