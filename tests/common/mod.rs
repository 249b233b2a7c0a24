//! Shared helpers for integration tests: a recording mock HTTP server and a
//! proxy instance wired against it.

#![allow(dead_code)]

use bytes::Bytes;
use gcs_signed_cache::config::Config;
use gcs_signed_cache::handler::RequestHandler;
use gcs_signed_cache::http_proxy::HttpProxy;
use gcs_signed_cache::shutdown::{ShutdownCoordinator, ShutdownSignal};
use gcs_signed_cache::transport::{HttpTransport, HyperTransport, ProxyBody};
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

pub const SERVICE_ACCOUNT_JSON: &str = include_str!("../fixtures/test_service_account.json");

/// A request as seen by [`MockServer`]
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

type Responder = dyn Fn(&SeenRequest) -> Response<Full<Bytes>> + Send + Sync;

/// Local HTTP/1 server that records requests and answers through a closure
pub struct MockServer {
    pub addr: SocketAddr,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
}

impl MockServer {
    pub async fn start<F>(respond: F) -> Self
    where
        F: Fn(&SeenRequest) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        Self::start_delayed(Duration::ZERO, respond).await
    }

    /// Like [`MockServer::start`], but every reply is held back by `delay`
    pub async fn start_delayed<F>(delay: Duration, respond: F) -> Self
    where
        F: Fn(&SeenRequest) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen: Arc<Mutex<Vec<SeenRequest>>> = Arc::new(Mutex::new(Vec::new()));
        let respond: Arc<Responder> = Arc::new(respond);

        let recorded = Arc::clone(&seen);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let recorded = Arc::clone(&recorded);
                let respond = Arc::clone(&respond);
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                        let recorded = Arc::clone(&recorded);
                        let respond = Arc::clone(&respond);
                        async move {
                            let (parts, body) = req.into_parts();
                            let body = body.collect().await.unwrap().to_bytes();
                            let seen = SeenRequest {
                                method: parts.method,
                                path_and_query: parts
                                    .uri
                                    .path_and_query()
                                    .map(|pq| pq.to_string())
                                    .unwrap_or_default(),
                                headers: parts.headers,
                                body,
                            };
                            let response = respond(&seen);
                            recorded.lock().unwrap().push(seen);
                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }
                            Ok::<_, Infallible>(response)
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, seen }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }
}

pub fn respond(status: StatusCode, headers: &[(&str, &str)], body: &str) -> Response<Full<Bytes>> {
    let mut builder = Response::builder()
        .status(status)
        .header("content-length", body.len().to_string());
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Full::new(Bytes::from(body.to_string()))).unwrap()
}

/// Token endpoint that always issues the same bearer token
pub async fn token_server() -> MockServer {
    MockServer::start(|_| {
        respond(
            StatusCode::OK,
            &[("content-type", "application/json")],
            r#"{"access_token":"ya29.integration","token_type":"Bearer","expires_in":3599}"#,
        )
    })
    .await
}

/// Configuration pointing the proxy at the mock servers
pub fn config_for(token: &MockServer, storage: &MockServer) -> Config {
    let mut config = Config::default();
    config.storage.endpoint = storage.url();
    config.storage.bucket = "media-bucket".to_string();
    config.credentials.key_json = Some(SERVICE_ACCOUNT_JSON.to_string());
    config.credentials.token_uri = Some(format!("{}/token", token.url()));
    config.credentials.exchange_timeout = Duration::from_secs(5);
    config.server.request_timeout = Duration::from_secs(5);
    config
}

/// A running proxy bound to an ephemeral port
pub struct RunningProxy {
    pub addr: SocketAddr,
    pub handler: Arc<RequestHandler<HyperTransport>>,
    pub coordinator: ShutdownCoordinator,
    client: HyperTransport,
}

impl RunningProxy {
    pub async fn start(config: &Config) -> Self {
        let key = config.credentials.load_key().unwrap();
        let transport = Arc::new(
            HyperTransport::new(&config.connection_pool, config.storage.upstream_timeout).unwrap(),
        );
        let handler = Arc::new(RequestHandler::from_config(config, key, transport).unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let proxy = HttpProxy::new(
            addr,
            Arc::clone(&handler),
            config.server.max_concurrent_requests,
            config.server.request_timeout,
        );

        let mut coordinator = ShutdownCoordinator::new(config.server.shutdown_timeout);
        coordinator.track_requests(proxy.semaphore(), proxy.max_concurrent_requests());
        let signal = ShutdownSignal::new(coordinator.subscribe());
        tokio::spawn(async move { proxy.serve(listener, signal).await });

        let client = HyperTransport::new(&config.connection_pool, Duration::from_secs(5)).unwrap();
        Self {
            addr,
            handler,
            coordinator,
            client,
        }
    }

    /// Send a request to the proxy with the given Host header
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        headers: &[(&str, &str)],
    ) -> Response<ProxyBody> {
        let mut builder = Request::builder()
            .method(method)
            .uri(format!("http://{}{}", self.addr, path))
            .header("host", "cdn.example.com");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder.body(Full::new(Bytes::new())).unwrap();
        self.client.send(request).await.unwrap()
    }

    pub async fn get(&self, path: &str) -> Response<ProxyBody> {
        self.request(Method::GET, path, &[]).await
    }
}

pub async fn body_string(response: Response<ProxyBody>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8_lossy(&bytes).to_string()
}
