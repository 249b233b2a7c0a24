//! Upstream Connector for Hyper Connection Pooling
//!
//! Dials the storage backend and the OAuth token endpoint. `https` URIs get a
//! rustls session on top of the TCP stream; plain `http` URIs are used as-is
//! (local emulators and tests).

use crate::{ProxyError, Result};
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tower::Service;
use tracing::{debug, warn};

/// Stream returned by [`UpstreamConnector`]
pub enum UpstreamStream {
    Plain(TokioIo<TcpStream>),
    Tls(TokioIo<TlsStream<TcpStream>>),
}

impl Read for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            UpstreamStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl Write for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            UpstreamStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            UpstreamStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            UpstreamStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl Connection for UpstreamStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// Connector implementing the `tower::Service<Uri>` contract required by Hyper's
/// pooled client.
#[derive(Clone)]
pub struct UpstreamConnector {
    tls_connector: TlsConnector,
    connect_timeout: Duration,
}

impl UpstreamConnector {
    /// Create a connector trusting the platform's native root certificates
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let mut root_store = rustls::RootCertStore::empty();

        match rustls_native_certs::load_native_certs() {
            Ok(certs) => {
                for cert in certs {
                    if let Err(e) = root_store.add(cert) {
                        debug!("Skipping unusable native certificate: {}", e);
                    }
                }
            }
            Err(e) => warn!("Failed to load native certs: {}", e),
        }

        if root_store.is_empty() {
            warn!("No native root certificates found; HTTPS upstreams will fail verification");
        }

        let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::TlsError(format!("Failed to configure TLS: {}", e)))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

        Ok(Self {
            tls_connector: TlsConnector::from(Arc::new(tls_config)),
            connect_timeout,
        })
    }
}

impl Service<Uri> for UpstreamConnector {
    type Response = UpstreamStream;
    type Error = ProxyError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let tls_connector = self.tls_connector.clone();
        let connect_timeout = self.connect_timeout;

        Box::pin(async move {
            let hostname = uri
                .host()
                .map(|host| host.trim_start_matches('[').trim_end_matches(']').to_string())
                .ok_or_else(|| ProxyError::InvalidRequest(format!("No host in URI: {}", uri)))?;

            let use_tls = match uri.scheme_str() {
                Some("https") => true,
                Some("http") => false,
                other => {
                    return Err(ProxyError::InvalidRequest(format!(
                        "Unsupported upstream scheme: {:?}",
                        other
                    )))
                }
            };
            let port = uri.port_u16().unwrap_or(if use_tls { 443 } else { 80 });

            let tcp = tokio::time::timeout(
                connect_timeout,
                TcpStream::connect((hostname.as_str(), port)),
            )
            .await
            .map_err(|_| {
                ProxyError::TimeoutError(format!(
                    "Connecting to {}:{} timed out after {:?}",
                    hostname, port, connect_timeout
                ))
            })?
            .map_err(|e| {
                warn!("TCP connection failed to {}:{}: {}", hostname, port, e);
                ProxyError::IoError(format!("Failed to connect to {}:{}: {}", hostname, port, e))
            })?;

            if let Err(e) = tcp.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY for {}:{}: {}", hostname, port, e);
            }

            if !use_tls {
                debug!("Plain connection established to {}:{}", hostname, port);
                return Ok(UpstreamStream::Plain(TokioIo::new(tcp)));
            }

            let server_name = ServerName::try_from(hostname.clone()).map_err(|e| {
                ProxyError::TlsError(format!("Invalid server name '{}': {}", hostname, e))
            })?;

            let tls = tls_connector.connect(server_name, tcp).await.map_err(|e| {
                warn!("TLS handshake failed to {}: {}", hostname, e);
                ProxyError::TlsError(format!("TLS handshake failed to {}: {}", hostname, e))
            })?;

            debug!("TLS connection established to {}:{}", hostname, port);
            Ok(UpstreamStream::Tls(TokioIo::new(tls)))
        })
    }
}
