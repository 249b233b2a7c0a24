//! Transport Module
//!
//! The outbound HTTP primitive shared by the OAuth token exchange and the storage
//! fetch. [`HttpTransport`] is the seam the request pipeline is generic over;
//! [`HyperTransport`] is the production implementation on Hyper's pooled client.

use crate::config::ConnectionPoolConfig;
use crate::https_connector::UpstreamConnector;
use crate::{ProxyError, Result};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::{Request, Response};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Response body type used throughout the proxy
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Wrap buffered bytes as a [`ProxyBody`]
pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Buffer a response body completely
pub async fn collect_body(body: ProxyBody) -> Result<Bytes> {
    let collected = body
        .collect()
        .await
        .map_err(|e| ProxyError::HttpError(format!("Failed to read body: {}", e)))?;
    Ok(collected.to_bytes())
}

/// Sends one fully-buffered request and returns the response head with a
/// (possibly streaming) body.
pub trait HttpTransport: Send + Sync + 'static {
    fn send(
        &self,
        request: Request<Full<Bytes>>,
    ) -> impl Future<Output = Result<Response<ProxyBody>>> + Send;
}

impl<T: HttpTransport> HttpTransport for Arc<T> {
    fn send(
        &self,
        request: Request<Full<Bytes>>,
    ) -> impl Future<Output = Result<Response<ProxyBody>>> + Send {
        self.as_ref().send(request)
    }
}

/// Request retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if delay >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay)
    }
}

/// Hyper client with connection pooling
pub struct HyperTransport {
    client: Client<UpstreamConnector, Full<Bytes>>,
    request_timeout: Duration,
}

impl HyperTransport {
    /// Create a new transport from connection pool settings; every request is
    /// bounded by `request_timeout`.
    pub fn new(config: &ConnectionPoolConfig, request_timeout: Duration) -> Result<Self> {
        let connector = UpstreamConnector::new(config.connect_timeout)?;

        let client = if config.keepalive_enabled {
            debug!(
                "Creating upstream client with keepalive enabled (idle_timeout: {}s, max_idle_per_host: {})",
                config.idle_timeout.as_secs(),
                config.max_idle_per_host
            );
            Client::builder(TokioExecutor::new())
                .pool_idle_timeout(config.idle_timeout)
                .pool_max_idle_per_host(config.max_idle_per_host)
                .build(connector)
        } else {
            debug!("Creating upstream client with keepalive disabled");
            Client::builder(TokioExecutor::new())
                .pool_idle_timeout(Duration::from_secs(0))
                .pool_max_idle_per_host(0)
                .build(connector)
        };

        Ok(Self {
            client,
            request_timeout,
        })
    }
}

impl HttpTransport for HyperTransport {
    async fn send(&self, request: Request<Full<Bytes>>) -> Result<Response<ProxyBody>> {
        let method = request.method().clone();
        let uri = request.uri().clone();

        let response = tokio::time::timeout(self.request_timeout, self.client.request(request))
            .await
            .map_err(|_| {
                ProxyError::TimeoutError(format!(
                    "{} {} timed out after {:?}",
                    method, uri, self.request_timeout
                ))
            })??;

        debug!("{} {} -> {}", method, uri, response.status());
        Ok(response.map(|body| body.boxed()))
    }
}
