//! gcs-signed-cache - authenticating caching proxy in front of a Google Cloud Storage bucket
//!
//! Every client request is signed with an OAuth2 access token obtained through the
//! service-account JWT-bearer grant, classified into an asset category, forwarded
//! to the bucket, and returned with a category-specific `Cache-Control` policy.

pub mod asset_rules;
pub mod base64url;
pub mod config;
pub mod credentials;
pub mod edge_cache;
pub mod error;
pub mod handler;
pub mod http_proxy;
pub mod https_connector;
pub mod logging;
pub mod proxy_request;
pub mod response;
pub mod service_account;
pub mod shutdown;
pub mod token_cache;
pub mod transport;

pub use error::{ProxyError, Result};
