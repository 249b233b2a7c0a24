//! Error Module
//!
//! Defines error types and result types used throughout the signed cache proxy.

use thiserror::Error;

/// Main error type for the signed cache proxy
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Signing or token exchange failure
    #[error("Credential error: {0}")]
    CredentialError(String),

    /// Storage backend fetch failure
    #[error("Upstream error: {0}")]
    UpstreamError(String),

    #[error("Timeout error: {0}")]
    TimeoutError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("System error: {0}")]
    SystemError(String),
}

impl ProxyError {
    /// Whether this error must stop the process rather than fail a single request
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProxyError::ConfigError(_))
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::IoError(err.to_string())
    }
}

impl From<hyper::Error> for ProxyError {
    fn from(err: hyper::Error) -> Self {
        ProxyError::HttpError(err.to_string())
    }
}

impl From<hyper::http::Error> for ProxyError {
    fn from(err: hyper::http::Error) -> Self {
        ProxyError::HttpError(err.to_string())
    }
}

impl ProxyError {
    /// Storage fetch failure; anything already classified as upstream is kept
    pub fn upstream(err: ProxyError) -> Self {
        match err {
            ProxyError::UpstreamError(_) => err,
            other => ProxyError::UpstreamError(other.to_string()),
        }
    }
}

/// `err` followed by each of its causes, joined with `: `
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

impl From<hyper_util::client::legacy::Error> for ProxyError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        ProxyError::HttpError(error_chain(&err))
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ProxyError {
    fn from(err: serde_yaml::Error) -> Self {
        ProxyError::SerializationError(err.to_string())
    }
}

/// Key material that the RSA backend rejects
impl From<rsa::Error> for ProxyError {
    fn from(err: rsa::Error) -> Self {
        ProxyError::ConfigError(format!("Invalid RSA key: {}", err))
    }
}

/// Result type alias for the signed cache proxy
pub type Result<T> = std::result::Result<T, ProxyError>;
