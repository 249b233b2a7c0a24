//! Response post-processing: `Cache-Control` synthesis, removal of backend-internal
//! headers, the optional policy debug header, and the uniform error response.
//!
//! The edge cache outcome header only reaches clients on debug-triggered requests.

use crate::asset_rules::{AssetKind, AssetRule, StatusClass};
use crate::config::DiagnosticsConfig;
use crate::edge_cache::EDGE_CACHE_HEADER;
use crate::transport::{full_body, ProxyBody};
use crate::ProxyError;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;
use tracing::warn;

/// Header name prefixes the storage backend uses for internal metadata
const BACKEND_HEADER_PREFIXES: [&str; 2] = ["x-goog", "x-guploader"];

/// Policy as reported in the debug header
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PolicyReport<'a> {
    /// Resolved edge cache key
    key: &'a str,
    asset: AssetKind,
    info: u32,
    ok: u32,
    redirects: u32,
    client_error: u32,
    server_error: u32,
    cache_tag: &'a str,
}

impl<'a> PolicyReport<'a> {
    fn new(rule: &'a AssetRule, cache_key: &'a str) -> Self {
        Self {
            key: cache_key,
            asset: rule.asset,
            info: rule.ttl.info,
            ok: rule.ttl.ok,
            redirects: rule.ttl.redirects,
            client_error: rule.ttl.client_error,
            server_error: rule.ttl.server_error,
            cache_tag: &rule.cache_tag,
        }
    }
}

/// `public, max-age=<ttl>` for the response status class, or `""` when there is
/// no rule or the status is outside 100-599.
pub fn cache_control_value(rule: Option<&AssetRule>, status: StatusCode) -> String {
    let ttl = rule.and_then(|rule| {
        StatusClass::from_code(status.as_u16()).map(|class| rule.ttl.for_class(class))
    });
    match ttl {
        Some(ttl) => format!("public, max-age={}", ttl),
        None => String::new(),
    }
}

/// Whether a header carries backend-internal metadata
pub fn is_backend_header(name: &str) -> bool {
    BACKEND_HEADER_PREFIXES.iter().any(|prefix| {
        name.len() >= prefix.len() && name.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
    })
}

/// Remove every backend-internal header
pub fn scrub_backend_headers(headers: &mut HeaderMap) {
    let doomed: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_backend_header(name.as_str()))
        .cloned()
        .collect();
    for name in doomed {
        headers.remove(&name);
    }
}

/// JSON rendering of the resolved policy and cache key, `{}` without a rule
pub fn policy_json(rule: Option<&AssetRule>, cache_key: &str) -> String {
    rule.and_then(|rule| serde_json::to_string(&PolicyReport::new(rule, cache_key)).ok())
        .unwrap_or_else(|| "{}".to_string())
}

fn debug_requested(request_headers: &HeaderMap, diagnostics: &DiagnosticsConfig) -> bool {
    diagnostics.enabled
        && request_headers
            .get(diagnostics.trigger_header.as_str())
            .is_some_and(|value| value.as_bytes() == diagnostics.trigger_value.as_bytes())
}

/// Apply the caching policy and header hygiene to an upstream response.
/// `cache_key` is the key the request's cache directives carried, if any.
pub fn finalize(
    mut response: Response<ProxyBody>,
    rule: Option<&AssetRule>,
    cache_key: Option<&str>,
    request_headers: &HeaderMap,
    diagnostics: &DiagnosticsConfig,
) -> Response<ProxyBody> {
    let cache_control = cache_control_value(rule, response.status());
    let headers = response.headers_mut();

    match HeaderValue::from_str(&cache_control) {
        Ok(value) => {
            headers.insert(CACHE_CONTROL, value);
        }
        Err(e) => warn!("Dropping unrepresentable Cache-Control '{}': {}", cache_control, e),
    }

    scrub_backend_headers(headers);

    if !debug_requested(request_headers, diagnostics) {
        headers.remove(EDGE_CACHE_HEADER);
    } else {
        let name = HeaderName::try_from(diagnostics.response_header.as_str());
        let value = HeaderValue::from_str(&policy_json(rule, cache_key.unwrap_or_default()));
        match (name, value) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(
                "Cannot attach debug header '{}'",
                diagnostics.response_header
            ),
        }
    }

    response
}

/// The uniform failure response: HTTP 500 with a JSON body naming the cause
pub fn error_response(err: &ProxyError) -> Response<ProxyBody> {
    let body = serde_json::json!({
        "code": 500,
        "message": format!("unable to sign request: {}", err),
    });

    let mut response = Response::new(full_body(body.to_string()));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Plain-text response for conditions the proxy raises itself (overload, timeout)
pub fn status_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(message.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset_rules::RuleTable;
    use crate::transport::collect_body;
    use quickcheck_macros::quickcheck;

    fn upstream(status: u16, headers: &[(&str, &str)]) -> Response<ProxyBody> {
        let mut builder = Response::builder().status(status);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(full_body("payload")).unwrap()
    }

    fn diagnostics(enabled: bool) -> DiagnosticsConfig {
        DiagnosticsConfig {
            enabled,
            ..DiagnosticsConfig::default()
        }
    }

    #[test]
    fn test_cache_control_by_status_class() {
        let table = RuleTable::default();
        let image = table.classify("/Images/a.jpg");

        assert_eq!(
            cache_control_value(image, StatusCode::NO_CONTENT),
            "public, max-age=3600"
        );
        assert_eq!(
            cache_control_value(image, StatusCode::NOT_FOUND),
            "public, max-age=10"
        );
        assert_eq!(
            cache_control_value(image, StatusCode::SWITCHING_PROTOCOLS),
            "public, max-age=0"
        );
        assert_eq!(cache_control_value(None, StatusCode::OK), "");
        assert_eq!(
            cache_control_value(image, StatusCode::from_u16(999).unwrap()),
            ""
        );
    }

    #[test]
    fn test_finalize_sets_empty_cache_control_without_rule() {
        let response = finalize(
            upstream(200, &[("cache-control", "private, max-age=60")]),
            None,
            None,
            &HeaderMap::new(),
            &diagnostics(false),
        );
        assert_eq!(response.headers().get(CACHE_CONTROL).unwrap(), "");
    }

    #[test]
    fn test_backend_headers_are_removed() {
        let response = finalize(
            upstream(
                200,
                &[
                    ("x-goog-generation", "1"),
                    ("X-Goog-Hash", "crc32c=abc"),
                    ("x-guploader-uploadid", "xyz"),
                    ("content-type", "image/jpeg"),
                    ("etag", "\"abc\""),
                    ("x-good-header", "kept"),
                ],
            ),
            None,
            None,
            &HeaderMap::new(),
            &diagnostics(false),
        );

        let headers = response.headers();
        assert!(headers.get("x-goog-generation").is_none());
        assert!(headers.get("x-goog-hash").is_none());
        assert!(headers.get("x-guploader-uploadid").is_none());
        assert_eq!(headers.get("content-type").unwrap(), "image/jpeg");
        assert_eq!(headers.get("etag").unwrap(), "\"abc\"");
        assert_eq!(headers.get("x-good-header").unwrap(), "kept");
    }

    #[quickcheck]
    fn prop_scrubbing_matches_prefix(suffix: String) -> bool {
        let suffix: String = suffix.chars().filter(|c| c.is_ascii_lowercase()).collect();
        is_backend_header(&format!("x-goog{}", suffix))
            && is_backend_header(&format!("X-GUPLOADER{}", suffix))
            && !is_backend_header(&format!("x-amz{}", suffix))
    }

    #[test]
    fn test_debug_header_requires_enabled_and_trigger() {
        let table = RuleTable::default();
        let rule = table.classify("/Images/a.jpg");
        let key = Some("cdn.example.com/media/Images/a.jpg");
        let mut triggered = HeaderMap::new();
        triggered.insert("erfi", HeaderValue::from_static("test"));

        let disabled = finalize(upstream(200, &[]), rule, key, &triggered, &diagnostics(false));
        assert!(disabled.headers().get("debug").is_none());

        let untriggered =
            finalize(upstream(200, &[]), rule, key, &HeaderMap::new(), &diagnostics(true));
        assert!(untriggered.headers().get("debug").is_none());

        let mut wrong_value = HeaderMap::new();
        wrong_value.insert("erfi", HeaderValue::from_static("prod"));
        let mismatched = finalize(upstream(200, &[]), rule, key, &wrong_value, &diagnostics(true));
        assert!(mismatched.headers().get("debug").is_none());

        let enabled = finalize(upstream(200, &[]), rule, key, &triggered, &diagnostics(true));
        let debug = enabled.headers().get("debug").unwrap().to_str().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(debug).unwrap();
        assert_eq!(parsed["key"], "cdn.example.com/media/Images/a.jpg");
        assert_eq!(parsed["asset"], "image");
        assert_eq!(parsed["ok"], 3600);
        assert_eq!(parsed["clientError"], 10);
        assert_eq!(parsed["cacheTag"], "signed-image");
    }

    #[test]
    fn test_debug_header_without_rule_is_empty_object() {
        let mut triggered = HeaderMap::new();
        triggered.insert("erfi", HeaderValue::from_static("test"));
        let response = finalize(upstream(200, &[]), None, None, &triggered, &diagnostics(true));
        assert_eq!(response.headers().get("debug").unwrap(), "{}");
    }

    #[test]
    fn test_edge_cache_outcome_only_on_debug_requests() {
        let table = RuleTable::default();
        let rule = table.classify("/Video/a.mp4");
        let hit = || upstream(200, &[(EDGE_CACHE_HEADER, "HIT")]);

        let plain = finalize(hit(), rule, None, &HeaderMap::new(), &diagnostics(true));
        assert!(plain.headers().get(EDGE_CACHE_HEADER).is_none());

        let mut triggered = HeaderMap::new();
        triggered.insert("erfi", HeaderValue::from_static("test"));
        let debugged = finalize(hit(), rule, None, &triggered, &diagnostics(true));
        assert_eq!(debugged.headers().get(EDGE_CACHE_HEADER).unwrap(), "HIT");
    }

    #[tokio::test]
    async fn test_error_response_shape() {
        let response = error_response(&ProxyError::CredentialError(
            "token endpoint returned 400".to_string(),
        ));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );

        let body = collect_body(response.into_body()).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["code"], 500);
        let message = parsed["message"].as_str().unwrap();
        assert!(message.starts_with("unable to sign request: "));
        assert!(message.contains("token endpoint returned 400"));
    }

    #[tokio::test]
    async fn test_finalize_keeps_status_and_body() {
        let response = finalize(
            upstream(206, &[("content-range", "bytes 0-6/100")]),
            RuleTable::default().classify("/v.mp4"),
            None,
            &HeaderMap::new(),
            &diagnostics(false),
        );
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers().get("content-range").unwrap(), "bytes 0-6/100");
        assert_eq!(
            response.headers().get(CACHE_CONTROL).unwrap(),
            "public, max-age=31556952"
        );
        let body = collect_body(response.into_body()).await.unwrap();
        assert_eq!(&body[..], b"payload");
    }
}
