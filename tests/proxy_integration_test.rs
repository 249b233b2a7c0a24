//! End-to-end tests: a real proxy listener in front of mock token and storage
//! servers, exercised over HTTP.

mod common;

use common::{body_string, config_for, respond, token_server, MockServer, RunningProxy};
use hyper::{Method, StatusCode};
use std::sync::Arc;
use std::time::Duration;

async fn storage_server() -> MockServer {
    MockServer::start(|req| match req.path_and_query.as_str() {
        p if p.starts_with("/media-bucket/Images/") => respond(
            StatusCode::OK,
            &[
                ("content-type", "image/jpeg"),
                ("x-goog-generation", "1700000000"),
                ("x-goog-hash", "crc32c=abc"),
                ("x-guploader-uploadid", "upl-1"),
                ("etag", "\"abc\""),
            ],
            "jpeg-bytes",
        ),
        p if p.starts_with("/media-bucket/Video/") => {
            respond(StatusCode::OK, &[("content-type", "video/mp4")], "mp4-bytes")
        }
        "/media-bucket/missing.css" => respond(StatusCode::NOT_FOUND, &[], "not found"),
        _ => respond(StatusCode::OK, &[], "plain"),
    })
    .await
}

#[tokio::test]
async fn test_image_request_is_signed_classified_and_scrubbed() {
    let token = token_server().await;
    let storage = storage_server().await;
    let proxy = RunningProxy::start(&config_for(&token, &storage)).await;

    let response = proxy.get("/Images/a.jpg?w=100").await;
    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers().clone();
    assert_eq!(headers.get("cache-control").unwrap(), "public, max-age=3600");
    assert_eq!(headers.get("etag").unwrap(), "\"abc\"");
    assert!(headers.get("x-goog-generation").is_none());
    assert!(headers.get("x-goog-hash").is_none());
    assert!(headers.get("x-guploader-uploadid").is_none());
    assert_eq!(body_string(response).await, "jpeg-bytes");

    let fetched = storage.requests();
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].path_and_query, "/media-bucket/Images/a.jpg?w=100");
    assert_eq!(
        fetched[0].headers.get("authorization").unwrap(),
        "Bearer ya29.integration"
    );

    // The token exchange carried a JWT-bearer assertion
    let exchanges = token.requests();
    assert_eq!(exchanges.len(), 1);
    assert_eq!(exchanges[0].method, Method::POST);
    assert_eq!(exchanges[0].path_and_query, "/token");
    let grant: serde_json::Value = serde_json::from_slice(&exchanges[0].body).unwrap();
    assert_eq!(
        grant["grant_type"],
        "urn:ietf:params:oauth:grant-type:jwt-bearer"
    );
    assert_eq!(grant["assertion"].as_str().unwrap().split('.').count(), 3);

    let cache = proxy.handler.edge_cache().unwrap();
    assert!(cache
        .get("cdn.example.com/media-bucket/Images/a.jpg?w=100")
        .is_some());
}

#[tokio::test]
async fn test_repeat_video_request_is_served_from_edge_cache() {
    let token = token_server().await;
    let storage = storage_server().await;
    let mut config = config_for(&token, &storage);
    config.diagnostics.enabled = true;
    let proxy = RunningProxy::start(&config).await;
    let debug = [("erfi", "test")];

    let first = proxy
        .request(Method::GET, "/Video/show/seg-1.m4s", &debug)
        .await;
    assert_eq!(first.headers().get("x-edge-cache").unwrap(), "MISS");
    assert_eq!(
        first.headers().get("cache-control").unwrap(),
        "public, max-age=31556952"
    );
    body_string(first).await;

    let second = proxy
        .request(Method::GET, "/Video/show/seg-1.m4s?token=other", &debug)
        .await;
    assert_eq!(second.headers().get("x-edge-cache").unwrap(), "HIT");
    assert_eq!(body_string(second).await, "mp4-bytes");

    // without the trigger the outcome stays internal
    let third = proxy.get("/Video/show/seg-1.m4s").await;
    assert!(third.headers().get("x-edge-cache").is_none());
    assert_eq!(body_string(third).await, "mp4-bytes");

    assert_eq!(storage.requests().len(), 1);
    assert_eq!(token.requests().len(), 1);
    assert_eq!(proxy.handler.edge_cache().unwrap().stats().hits, 2);
}

#[tokio::test]
async fn test_status_specific_ttl_on_not_found() {
    let token = token_server().await;
    let storage = storage_server().await;
    let proxy = RunningProxy::start(&config_for(&token, &storage)).await;

    let response = proxy.get("/missing.css").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        response.headers().get("cache-control").unwrap(),
        "public, max-age=10"
    );
}

#[tokio::test]
async fn test_unclassified_path_gets_empty_cache_control() {
    let token = token_server().await;
    let storage = storage_server().await;
    let proxy = RunningProxy::start(&config_for(&token, &storage)).await;

    let response = proxy.get("/docs/readme.txt").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("cache-control").unwrap(), "");
    assert!(response.headers().get("x-edge-cache").is_none());
    assert_eq!(body_string(response).await, "plain");
}

#[tokio::test]
async fn test_rejected_token_exchange_yields_500() {
    let token = MockServer::start(|_| {
        respond(
            StatusCode::BAD_REQUEST,
            &[("content-type", "application/json")],
            r#"{"error":"invalid_grant","error_description":"Invalid JWT Signature."}"#,
        )
    })
    .await;
    let storage = storage_server().await;
    let proxy = RunningProxy::start(&config_for(&token, &storage)).await;

    let response = proxy.get("/Images/a.jpg").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/json"
    );
    let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["code"], 500);
    assert!(body["message"]
        .as_str()
        .unwrap()
        .starts_with("unable to sign request"));
    assert!(storage.requests().is_empty());
}

#[tokio::test]
async fn test_debug_header_only_with_trigger() {
    let token = token_server().await;
    let storage = storage_server().await;
    let mut config = config_for(&token, &storage);
    config.diagnostics.enabled = true;
    let proxy = RunningProxy::start(&config).await;

    let plain = proxy.get("/Images/b.png").await;
    assert!(plain.headers().get("debug").is_none());

    let triggered = proxy
        .request(Method::GET, "/Images/b.png", &[("erfi", "test")])
        .await;
    let report: serde_json::Value = serde_json::from_str(
        triggered.headers().get("debug").unwrap().to_str().unwrap(),
    )
    .unwrap();
    assert_eq!(report["key"], "cdn.example.com/media-bucket/Images/b.png");
    assert_eq!(report["asset"], "image");
    assert_eq!(report["ok"], 3600);
    assert_eq!(report["cacheTag"], "signed-image");
}

#[tokio::test]
async fn test_shutdown_stops_accepting() {
    let token = token_server().await;
    let storage = storage_server().await;
    let proxy = RunningProxy::start(&config_for(&token, &storage)).await;

    assert_eq!(proxy.get("/docs/a.txt").await.status(), StatusCode::OK);
    proxy.coordinator.initiate_shutdown().await.unwrap();

    // give the accept loop a moment to observe the signal
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let connect = tokio::net::TcpStream::connect(proxy.addr).await;
    assert!(connect.is_err());
}

#[tokio::test]
async fn test_refused_storage_connection_is_upstream_error() {
    let token = token_server().await;
    let storage = storage_server().await;
    let mut config = config_for(&token, &storage);
    // nothing listens on port 1
    config.storage.endpoint = "http://127.0.0.1:1".to_string();
    let proxy = RunningProxy::start(&config).await;

    let response = proxy.get("/Images/a.jpg").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    let message = body["message"].as_str().unwrap();
    assert!(message.starts_with("unable to sign request: Upstream error: "));
    // the connector's cause survives
    assert!(message.contains("Failed to connect to 127.0.0.1:1"));
}

#[tokio::test]
async fn test_stalled_token_exchange_times_out() {
    let token = MockServer::start_delayed(Duration::from_secs(5), |_| {
        respond(
            StatusCode::OK,
            &[("content-type", "application/json")],
            r#"{"access_token":"late","token_type":"Bearer","expires_in":3599}"#,
        )
    })
    .await;
    let storage = storage_server().await;
    let mut config = config_for(&token, &storage);
    config.credentials.exchange_timeout = Duration::from_millis(200);
    let proxy = RunningProxy::start(&config).await;

    let response = proxy.get("/Images/a.jpg").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_string(response).await;
    assert!(body.contains("unable to sign request"));
    assert!(body.contains("timed out"));
    assert!(storage.requests().is_empty());
}

#[tokio::test]
async fn test_stalled_storage_yields_gateway_timeout() {
    let token = token_server().await;
    let storage =
        MockServer::start_delayed(Duration::from_secs(5), |_| respond(StatusCode::OK, &[], "late"))
            .await;
    let mut config = config_for(&token, &storage);
    config.server.request_timeout = Duration::from_millis(300);
    let proxy = RunningProxy::start(&config).await;

    let response = proxy.get("/Images/a.jpg").await;
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn test_requests_beyond_the_limit_get_429() {
    let token = token_server().await;
    let storage =
        MockServer::start_delayed(Duration::from_millis(500), |_| respond(StatusCode::OK, &[], "slow"))
            .await;
    let mut config = config_for(&token, &storage);
    config.server.max_concurrent_requests = 1;
    let proxy = Arc::new(RunningProxy::start(&config).await);

    let held = {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move { proxy.get("/Images/held.jpg").await.status() })
    };
    // let the first request take the only permit
    tokio::time::sleep(Duration::from_millis(150)).await;

    let rejected = proxy.get("/Images/other.jpg").await;
    assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(rejected.headers().get("retry-after").unwrap(), "10");

    assert_eq!(held.await.unwrap(), StatusCode::OK);
}
