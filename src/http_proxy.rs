//! HTTP Proxy Module
//!
//! Accept loop and per-connection serving. Each request is buffered, bounded by
//! the concurrency limit and the request timeout, then handed to the
//! [`RequestHandler`] pipeline.

use crate::handler::RequestHandler;
use crate::response::status_response;
use crate::shutdown::ShutdownSignal;
use crate::transport::{HttpTransport, ProxyBody};
use crate::Result;
use http_body_util::BodyExt;
use hyper::header::{HeaderValue, RETRY_AFTER};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// HTTP front end of the proxy
pub struct HttpProxy<T> {
    listen_addr: SocketAddr,
    handler: Arc<RequestHandler<T>>,
    request_semaphore: Arc<Semaphore>,
    max_concurrent_requests: usize,
    request_timeout: Duration,
    active_connections: Arc<AtomicUsize>,
}

impl<T: HttpTransport + 'static> HttpProxy<T> {
    pub fn new(
        listen_addr: SocketAddr,
        handler: Arc<RequestHandler<T>>,
        max_concurrent_requests: usize,
        request_timeout: Duration,
    ) -> Self {
        Self {
            listen_addr,
            handler,
            request_semaphore: Arc::new(Semaphore::new(max_concurrent_requests)),
            max_concurrent_requests,
            request_timeout,
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Permits held by in-flight requests, for the shutdown coordinator
    pub fn semaphore(&self) -> Arc<Semaphore> {
        Arc::clone(&self.request_semaphore)
    }

    pub fn max_concurrent_requests(&self) -> usize {
        self.max_concurrent_requests
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Bind the configured address and serve until shutdown
    pub async fn start(&self, shutdown_signal: ShutdownSignal) -> Result<()> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        info!("HTTP proxy listening on {}", self.listen_addr);
        self.serve(listener, shutdown_signal).await
    }

    /// Serve connections from an already bound listener until shutdown
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown_signal: ShutdownSignal,
    ) -> Result<()> {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            debug!("HTTP connection from {}", addr);

                            // Disable Nagle's algorithm for lower latency
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                            }

                            let handler = Arc::clone(&self.handler);
                            let request_semaphore = Arc::clone(&self.request_semaphore);
                            let active_connections = Arc::clone(&self.active_connections);
                            let request_timeout = self.request_timeout;

                            tokio::spawn(async move {
                                Self::serve_connection(
                                    stream,
                                    addr,
                                    handler,
                                    request_semaphore,
                                    active_connections,
                                    request_timeout,
                                )
                                .await;
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept HTTP connection: {}", e);
                        }
                    }
                }
                _ = shutdown_signal.wait_for_shutdown() => {
                    info!("HTTP proxy received shutdown signal, stopping accept loop");
                    break;
                }
            }
        }

        info!(
            "HTTP proxy stopped accepting connections ({} still open)",
            self.active_connections()
        );
        Ok(())
    }

    async fn serve_connection(
        stream: TcpStream,
        addr: SocketAddr,
        handler: Arc<RequestHandler<T>>,
        request_semaphore: Arc<Semaphore>,
        active_connections: Arc<AtomicUsize>,
        request_timeout: Duration,
    ) {
        let io = TokioIo::new(stream);
        active_connections.fetch_add(1, Ordering::Relaxed);

        let service = service_fn(move |req| {
            let handler = Arc::clone(&handler);
            let request_semaphore = Arc::clone(&request_semaphore);
            async move {
                Self::handle_request(req, handler, request_semaphore, request_timeout).await
            }
        });

        if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
            let err_str = err.to_string();
            if err_str.contains("connection closed")
                || err_str.contains("broken pipe")
                || err_str.contains("reset by peer")
                || err.is_canceled()
                || err.is_incomplete_message()
            {
                debug!("Client disconnected from {}: {}", addr, err);
            } else {
                error!("Error serving HTTP connection from {}: {}", addr, err);
            }
        }

        active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Handle a single HTTP request
    pub async fn handle_request(
        req: Request<hyper::body::Incoming>,
        handler: Arc<RequestHandler<T>>,
        request_semaphore: Arc<Semaphore>,
        request_timeout: Duration,
    ) -> std::result::Result<Response<ProxyBody>, Infallible> {
        let _permit = match request_semaphore.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                warn!("Request limit exceeded, returning 429");
                let mut response = status_response(
                    StatusCode::TOO_MANY_REQUESTS,
                    "Request rate exceeded. Please retry after some time.",
                );
                response
                    .headers_mut()
                    .insert(RETRY_AFTER, HeaderValue::from_static("10"));
                return Ok(response);
            }
        };

        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!("Failed to read request body for {}: {}", parts.uri, e);
                return Ok(status_response(
                    StatusCode::BAD_REQUEST,
                    "Failed to read request body",
                ));
            }
        };
        let request = Request::from_parts(parts, body);
        let path = request.uri().path().to_string();

        match tokio::time::timeout(request_timeout, handler.handle(request)).await {
            Ok(response) => Ok(response),
            Err(_) => {
                warn!("Request for {} timed out after {:?}", path, request_timeout);
                Ok(status_response(
                    StatusCode::GATEWAY_TIMEOUT,
                    "Request timed out",
                ))
            }
        }
    }
}
