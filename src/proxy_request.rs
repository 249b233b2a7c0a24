//! Proxy Request Module
//!
//! Turns an inbound client request into the authenticated storage request:
//! the path is prefixed with the bucket path, the bearer credential is attached,
//! and, when the path matched an asset rule, [`CacheDirectives`] ride along as a
//! request extension for the edge cache.

use crate::asset_rules::{AssetRule, CacheKeyScope, TtlByStatus};
use crate::credentials::AccessToken;
use crate::{ProxyError, Result};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderMap, HeaderValue, AUTHORIZATION, HOST};
use hyper::{Request, Uri};
use serde::Serialize;

/// Edge cache hints for one outbound request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheDirectives {
    pub cache_key: String,
    pub cache_everything: bool,
    pub ttl_by_status: TtlByStatus,
    pub cache_tags: Vec<String>,
}

impl CacheDirectives {
    /// Directives for a request whose path matched `rule`
    pub fn for_rule(
        rule: &AssetRule,
        host: &str,
        bucket_path: &str,
        path: &str,
        query: Option<&str>,
    ) -> Self {
        let mut cache_key = format!("{}{}{}", host, bucket_path, path);
        if rule.key_scope == CacheKeyScope::PathAndQuery {
            if let Some(query) = query.filter(|q| !q.is_empty()) {
                cache_key.push('?');
                cache_key.push_str(query);
            }
        }

        Self {
            cache_key,
            cache_everything: true,
            ttl_by_status: rule.ttl,
            cache_tags: vec![rule.cache_tag.clone()],
        }
    }

    /// TTL for a response status, `None` outside 100-599
    pub fn ttl_for_status(&self, status: u16) -> Option<u32> {
        self.ttl_by_status.for_status(status)
    }
}

/// Storage endpoint and bucket the proxy forwards to
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    endpoint: String,
    bucket_path: String,
}

impl UpstreamTarget {
    /// `endpoint` is `scheme://host[:port]`; `bucket` may be given with or
    /// without slashes (`my-bucket`, `/my-bucket/`).
    pub fn new(endpoint: &str, bucket: &str) -> Result<Self> {
        let endpoint = endpoint.trim_end_matches('/').to_string();
        let parsed: Uri = endpoint
            .parse()
            .map_err(|e| ProxyError::ConfigError(format!("Invalid storage endpoint '{}': {}", endpoint, e)))?;
        if parsed.scheme().is_none() || parsed.authority().is_none() {
            return Err(ProxyError::ConfigError(format!(
                "Storage endpoint must be an absolute URL: {}",
                endpoint
            )));
        }

        let bucket = bucket.trim_matches('/');
        if bucket.is_empty() {
            return Err(ProxyError::ConfigError(
                "Storage bucket must not be empty".to_string(),
            ));
        }

        Ok(Self {
            endpoint,
            bucket_path: format!("/{}", bucket),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Bucket path with a leading slash, e.g. `/my-bucket`
    pub fn bucket_path(&self) -> &str {
        &self.bucket_path
    }

    /// `{endpoint}{bucket-path}{path}{?query}`
    pub fn uri_for(&self, path: &str, query: Option<&str>) -> Result<Uri> {
        let mut uri = format!("{}{}{}", self.endpoint, self.bucket_path, path);
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            uri.push('?');
            uri.push_str(query);
        }
        uri.parse()
            .map_err(|e| ProxyError::InvalidRequest(format!("Invalid upstream URI '{}': {}", uri, e)))
    }
}

/// Host the client addressed, without any port
pub fn request_host(request: &Request<Bytes>) -> String {
    let raw = request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| request.uri().host())
        .unwrap_or_default();

    if raw.starts_with('[') {
        // IPv6 literal, keep the brackets
        return match raw.find(']') {
            Some(end) => raw[..=end].to_string(),
            None => raw.to_string(),
        };
    }
    raw.split(':').next().unwrap_or_default().to_string()
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// End-to-end headers of the inbound request, minus `Host` and anything the
/// `Connection` header nominates.
fn forwarded_headers(inbound: &HeaderMap) -> HeaderMap {
    let nominated: Vec<String> = inbound
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    let mut headers = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound {
        let name_str = name.as_str();
        if *name == HOST || is_hop_by_hop(name_str) || nominated.iter().any(|n| n == name_str) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Build the authenticated storage request for `inbound`
pub fn build_upstream_request(
    inbound: &Request<Bytes>,
    target: &UpstreamTarget,
    token: &AccessToken,
    rule: Option<&AssetRule>,
) -> Result<Request<Full<Bytes>>> {
    let path = inbound.uri().path();
    let query = inbound.uri().query();
    let uri = target.uri_for(path, query)?;

    let authorization = HeaderValue::from_str(&token.authorization_value()).map_err(|_| {
        ProxyError::CredentialError("Access token is not a valid header value".to_string())
    })?;

    let mut request = Request::builder()
        .method(inbound.method().clone())
        .uri(uri)
        .body(Full::new(inbound.body().clone()))?;

    *request.headers_mut() = forwarded_headers(inbound.headers());
    request.headers_mut().insert(AUTHORIZATION, authorization);

    if let Some(rule) = rule {
        let host = request_host(inbound);
        request.extensions_mut().insert(CacheDirectives::for_rule(
            rule,
            &host,
            target.bucket_path(),
            path,
            query,
        ));
    }

    Ok(request)
}
