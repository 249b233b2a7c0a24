//! Credential Signer Module
//!
//! Issues short-lived OAuth access tokens for the service account using the
//! JWT-bearer grant: a signed assertion is built locally and exchanged at the
//! token endpoint.
//!
//! # Assertion Layout
//!
//! | Segment | Content |
//! |---|---|
//! | header | `{"alg":"RS256","typ":"JWT"}` |
//! | claims | `{"iss","scope","aud","exp","iat"}`, `exp = iat + 3600` |
//! | signature | RSASSA-PKCS1-v1_5 / SHA-256 over `"{header}.{claims}"` |

use crate::base64url;
use crate::service_account::ServiceAccountKey;
use crate::transport::{collect_body, HttpTransport, RetryConfig};
use crate::{ProxyError, Result};
use bytes::Bytes;
use http_body_util::Full;
use hyper::{header, Method, Request, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Maximum assertion lifetime accepted by the token endpoint
pub const ASSERTION_LIFETIME_SECS: u64 = 3600;

/// Read-write access to Cloud Storage
pub const DEVSTORAGE_READ_WRITE_SCOPE: &str =
    "https://www.googleapis.com/auth/devstorage.read_write";

pub const JWT_BEARER_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssertionHeader {
    pub alg: String,
    pub typ: String,
}

impl Default for AssertionHeader {
    fn default() -> Self {
        Self {
            alg: "RS256".to_string(),
            typ: "JWT".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssertionClaims {
    pub iss: String,
    pub scope: String,
    pub aud: String,
    pub exp: u64,
    pub iat: u64,
}

impl AssertionClaims {
    pub fn new(issuer: &str, scope: &str, audience: &str, issued_at: u64) -> Self {
        Self {
            iss: issuer.to_string(),
            scope: scope.to_string(),
            aud: audience.to_string(),
            exp: issued_at + ASSERTION_LIFETIME_SECS,
            iat: issued_at,
        }
    }
}

/// Signed bearer assertion; every segment is base64url text
#[derive(Debug, Clone)]
pub struct BearerAssertion {
    pub header: String,
    pub claims: String,
    pub signature: String,
}

impl BearerAssertion {
    /// Build and sign an assertion for `key` issued at `issued_at` (unix seconds)
    pub fn sign(key: &ServiceAccountKey, scope: &str, issued_at: u64) -> Result<Self> {
        let header = base64url::encode_json(&AssertionHeader::default())?;
        let claims = base64url::encode_json(&AssertionClaims::new(
            key.client_email(),
            scope,
            key.token_uri(),
            issued_at,
        ))?;

        let signing_input = format!("{}.{}", header, claims);
        let signature = base64url::encode(key.sign(signing_input.as_bytes())?);

        Ok(Self {
            header,
            claims,
            signature,
        })
    }

    /// The bytes covered by the signature
    pub fn signing_input(&self) -> String {
        format!("{}.{}", self.header, self.claims)
    }
}

impl fmt::Display for BearerAssertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.header, self.claims, self.signature)
    }
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    grant_type: &'a str,
    assertion: &'a str,
}

/// Access token returned by the OAuth endpoint
#[derive(Clone, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("access_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

impl AccessToken {
    /// `Authorization` header value
    pub fn authorization_value(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }

    /// Declared lifetime, capped at the assertion lifetime
    pub fn lifetime(&self) -> Duration {
        Duration::from_secs(
            self.expires_in
                .unwrap_or(ASSERTION_LIFETIME_SECS)
                .min(ASSERTION_LIFETIME_SECS),
        )
    }
}

/// Seconds since the unix epoch
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Signs assertions and exchanges them for access tokens
pub struct TokenIssuer<T> {
    key: Arc<ServiceAccountKey>,
    transport: Arc<T>,
    scope: String,
    exchange_timeout: Duration,
    retry: RetryConfig,
}

impl<T: HttpTransport> TokenIssuer<T> {
    pub fn new(key: Arc<ServiceAccountKey>, transport: Arc<T>) -> Self {
        Self {
            key,
            transport,
            scope: DEVSTORAGE_READ_WRITE_SCOPE.to_string(),
            exchange_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn with_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Identity the issued tokens belong to
    pub fn identity(&self) -> &str {
        self.key.client_email()
    }

    /// Sign a fresh assertion and exchange it for an access token
    pub async fn issue_access_token(&self) -> Result<AccessToken> {
        let mut attempt = 0;
        loop {
            match self.exchange_once().await {
                Ok(token) => return Ok(token),
                Err(Exchange::Retryable(e)) if attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        "Token exchange failed (attempt {}/{}), retrying in {:?}: {}",
                        attempt, self.retry.max_retries, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(Exchange::Retryable(e)) | Err(Exchange::Fatal(e)) => return Err(e),
            }
        }
    }

    async fn exchange_once(&self) -> std::result::Result<AccessToken, Exchange> {
        let assertion = BearerAssertion::sign(&self.key, &self.scope, unix_now())
            .map_err(Exchange::Fatal)?
            .to_string();

        let body = serde_json::to_vec(&TokenRequest {
            grant_type: JWT_BEARER_GRANT_TYPE,
            assertion: &assertion,
        })
        .map_err(|e| Exchange::Fatal(e.into()))?;

        let request = Request::builder()
            .method(Method::POST)
            .uri(self.key.token_uri())
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| {
                Exchange::Fatal(ProxyError::CredentialError(format!(
                    "Invalid token endpoint '{}': {}",
                    self.key.token_uri(),
                    e
                )))
            })?;

        let response = tokio::time::timeout(self.exchange_timeout, self.transport.send(request))
            .await
            .map_err(|_| {
                Exchange::Retryable(ProxyError::CredentialError(format!(
                    "Token endpoint timed out after {:?}",
                    self.exchange_timeout
                )))
            })?
            .map_err(|e| {
                Exchange::Retryable(ProxyError::CredentialError(format!(
                    "Token endpoint unreachable: {}",
                    e
                )))
            })?;

        let status = response.status();
        let body = collect_body(response.into_body()).await.map_err(|e| {
            Exchange::Retryable(ProxyError::CredentialError(format!(
                "Failed to read token response: {}",
                e
            )))
        })?;

        if !status.is_success() {
            let err = ProxyError::CredentialError(format!(
                "Token endpoint returned {}: {}",
                status,
                String::from_utf8_lossy(&body).trim()
            ));
            return Err(if is_retryable_status(status) {
                Exchange::Retryable(err)
            } else {
                Exchange::Fatal(err)
            });
        }

        let token: AccessToken = serde_json::from_slice(&body).map_err(|e| {
            Exchange::Fatal(ProxyError::CredentialError(format!(
                "Malformed token response: {}",
                e
            )))
        })?;

        debug!(
            "Issued access token for {} (expires_in: {:?})",
            self.key.client_email(),
            token.expires_in
        );
        Ok(token)
    }
}

/// Outcome classification for a failed exchange attempt
enum Exchange {
    Retryable(ProxyError),
    Fatal(ProxyError),
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}
