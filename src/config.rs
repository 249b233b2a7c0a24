//! Configuration Module
//!
//! Handles configuration loading from files, environment variables, and command-line arguments.
//! Precedence, lowest to highest: built-in defaults, YAML file, environment, CLI flags.

use crate::asset_rules::RuleTable;
use crate::credentials::DEVSTORAGE_READ_WRITE_SCOPE;
use crate::service_account::ServiceAccountKey;
use crate::transport::RetryConfig;
use crate::{ProxyError, Result};
use clap::{Arg, ArgMatches, Command};
use hyper::header::HeaderName;
use serde::{Deserialize, Serialize};

use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// Custom deserializer for optional paths that expands ~ to home directory
mod pathbuf_serde {
    use serde::{Deserialize, Deserializer};
    use std::path::PathBuf;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<PathBuf>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        Ok(s.map(|s| expand_tilde(&s)))
    }

    pub(super) fn expand_tilde(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = std::env::var_os("HOME") {
                let mut result = PathBuf::from(home);
                result.push(rest);
                return result;
            }
        }
        PathBuf::from(path)
    }
}

/// Custom deserializer for Duration from string format like "30s", "5m", "1h"
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty duration string".to_string());
        }

        let num_end = s
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
            .map(|(i, _)| i)
            .unwrap_or(s.len());

        if num_end == 0 {
            return Err(format!("No number found in duration string: {}", s));
        }

        let num_str = &s[..num_end];
        let unit = s[num_end..].trim();

        let value: f64 = num_str
            .parse()
            .map_err(|e| format!("Failed to parse number '{}': {}", num_str, e))?;

        let duration = match unit {
            "s" | "sec" | "secs" | "second" | "seconds" => Duration::from_secs_f64(value),
            "m" | "min" | "mins" | "minute" | "minutes" => Duration::from_secs_f64(value * 60.0),
            "h" | "hr" | "hrs" | "hour" | "hours" => Duration::from_secs_f64(value * 3600.0),
            "ms" | "millis" | "millisecond" | "milliseconds" => {
                Duration::from_secs_f64(value / 1000.0)
            }
            "" => Duration::from_secs_f64(value), // Default to seconds if no unit
            _ => return Err(format!("Unknown duration unit: {}", unit)),
        };

        Ok(duration)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
    #[serde(default)]
    pub edge_cache: EdgeCacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub connection_pool: ConnectionPoolConfig,
    /// File the configuration was read from, if any
    #[serde(skip)]
    pub source_file: Option<String>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Requests beyond this many in flight are rejected with 429
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(
        deserialize_with = "duration_serde::deserialize",
        default = "default_request_timeout"
    )]
    pub request_timeout: Duration,
    #[serde(
        deserialize_with = "duration_serde::deserialize",
        default = "default_shutdown_timeout"
    )]
    pub shutdown_timeout: Duration,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_max_concurrent_requests() -> usize {
    256
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            http_port: default_http_port(),
            max_concurrent_requests: default_max_concurrent_requests(),
            request_timeout: default_request_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_concurrent_requests == 0 {
            return Err("max_concurrent_requests must be at least 1".to_string());
        }
        if self.request_timeout.is_zero() {
            return Err("request_timeout must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Storage backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Bucket name; required
    pub bucket: String,
    pub endpoint: String,
    #[serde(deserialize_with = "duration_serde::deserialize")]
    pub upstream_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            endpoint: "https://storage.googleapis.com".to_string(),
            upstream_timeout: Duration::from_secs(30),
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.bucket.trim_matches('/').is_empty() {
            return Err("bucket is required (storage.bucket or GCS_BUCKET)".to_string());
        }
        if !(self.endpoint.starts_with("https://") || self.endpoint.starts_with("http://")) {
            return Err(format!(
                "endpoint must start with http:// or https://, got {}",
                self.endpoint
            ));
        }
        if self.upstream_timeout.is_zero() {
            return Err("upstream_timeout must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Service account and token exchange configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Inline key material (service-account JSON or JWK); wins over `key_file`
    pub key_json: Option<String>,
    #[serde(deserialize_with = "pathbuf_serde::deserialize")]
    pub key_file: Option<PathBuf>,
    /// Overrides the key's `client_email`
    pub service_account_email: Option<String>,
    /// Overrides the key's `token_uri`
    pub token_uri: Option<String>,
    pub scope: String,
    pub cache_tokens: bool,
    #[serde(deserialize_with = "duration_serde::deserialize")]
    pub refresh_margin: Duration,
    #[serde(deserialize_with = "duration_serde::deserialize")]
    pub exchange_timeout: Duration,
    pub max_retries: usize,
    #[serde(deserialize_with = "duration_serde::deserialize")]
    pub retry_initial_delay: Duration,
}

impl std::fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("key_json", &self.key_json.as_ref().map(|_| "<redacted>"))
            .field("key_file", &self.key_file)
            .field("service_account_email", &self.service_account_email)
            .field("token_uri", &self.token_uri)
            .field("scope", &self.scope)
            .field("cache_tokens", &self.cache_tokens)
            .field("refresh_margin", &self.refresh_margin)
            .field("exchange_timeout", &self.exchange_timeout)
            .field("max_retries", &self.max_retries)
            .field("retry_initial_delay", &self.retry_initial_delay)
            .finish()
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            key_json: None,
            key_file: None,
            service_account_email: None,
            token_uri: None,
            scope: DEVSTORAGE_READ_WRITE_SCOPE.to_string(),
            cache_tokens: true,
            refresh_margin: Duration::from_secs(300),
            exchange_timeout: Duration::from_secs(30),
            max_retries: 0,
            retry_initial_delay: Duration::from_millis(100),
        }
    }
}

impl CredentialsConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        let has_inline = self.key_json.as_deref().is_some_and(|k| !k.trim().is_empty());
        if !has_inline && self.key_file.is_none() {
            return Err(
                "a service account key is required (credentials.key_json, credentials.key_file, GCS_JSON or GCS_KEY_FILE)"
                    .to_string(),
            );
        }
        if self.refresh_margin >= Duration::from_secs(3600) {
            return Err(format!(
                "refresh_margin must be shorter than the one hour token lifetime, got {:?}",
                self.refresh_margin
            ));
        }
        if self.exchange_timeout.is_zero() {
            return Err("exchange_timeout must be greater than zero".to_string());
        }
        if self.max_retries > 10 {
            return Err(format!(
                "max_retries must be between 0 and 10, got {}",
                self.max_retries
            ));
        }
        Ok(())
    }

    /// Parse the configured key material
    pub fn load_key(&self) -> Result<ServiceAccountKey> {
        let email = self.service_account_email.as_deref();
        let key = match (&self.key_json, &self.key_file) {
            (Some(inline), _) if !inline.trim().is_empty() => ServiceAccountKey::parse(inline, email)?,
            (_, Some(path)) => ServiceAccountKey::from_file(path, email)?,
            _ => {
                return Err(ProxyError::ConfigError(
                    "No service account key configured".to_string(),
                ))
            }
        };

        Ok(match &self.token_uri {
            Some(uri) => key.with_token_uri(uri.clone()),
            None => key,
        })
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            initial_delay: self.retry_initial_delay,
            ..RetryConfig::default()
        }
    }
}

/// Asset classifier configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Match file extensions case-sensitively (`.JPG` is then not an image)
    pub case_sensitive_extensions: bool,
}

impl ClassifierConfig {
    pub fn rule_table(&self) -> RuleTable {
        RuleTable::with_case_sensitive_extensions(self.case_sensitive_extensions)
    }
}

/// Policy debug header configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub enabled: bool,
    pub trigger_header: String,
    pub trigger_value: String,
    pub response_header: String,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            trigger_header: "erfi".to_string(),
            trigger_value: "test".to_string(),
            response_header: "debug".to_string(),
        }
    }
}

impl DiagnosticsConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        for (field, name) in [
            ("trigger_header", &self.trigger_header),
            ("response_header", &self.response_header),
        ] {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| format!("{} is not a valid header name: '{}'", field, name))?;
        }
        Ok(())
    }
}

/// In-memory edge cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeCacheConfig {
    pub enabled: bool,
    pub max_entries: usize,
    /// Largest response body stored, in bytes
    pub max_object_size: u64,
}

impl Default for EdgeCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10_000,
            max_object_size: 8 * 1024 * 1024,
        }
    }
}

impl EdgeCacheConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.enabled && self.max_entries == 0 {
            return Err("max_entries must be at least 1 when the edge cache is enabled".to_string());
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    /// Directory for daily-rolling application logs; console only when unset
    #[serde(deserialize_with = "pathbuf_serde::deserialize")]
    pub app_log_dir: Option<PathBuf>,
    /// Emit one `access` line per request
    pub access_log: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            app_log_dir: None,
            access_log: true,
        }
    }
}

/// Outbound connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionPoolConfig {
    #[serde(deserialize_with = "duration_serde::deserialize")]
    pub connect_timeout: Duration,
    /// Enable HTTP connection keepalive (persistent connections)
    pub keepalive_enabled: bool,
    #[serde(deserialize_with = "duration_serde::deserialize")]
    pub idle_timeout: Duration,
    pub max_idle_per_host: usize,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keepalive_enabled: true,
            idle_timeout: Duration::from_secs(30),
            max_idle_per_host: 10,
        }
    }
}

impl ConnectionPoolConfig {
    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        let idle_timeout_secs = self.idle_timeout.as_secs();
        if !(1..=300).contains(&idle_timeout_secs) {
            return Err(format!(
                "Idle timeout must be between 1 and 300 seconds, got {}",
                idle_timeout_secs
            ));
        }

        if self.max_idle_per_host > 100 {
            return Err(format!(
                "Max idle connections per host must be at most 100, got {}",
                self.max_idle_per_host
            ));
        }

        Ok(())
    }
}

fn parse_flag(value: &str) -> bool {
    value.to_lowercase() == "true"
}

impl Config {
    /// Load configuration from file, environment, and command line
    pub fn load() -> Result<Self> {
        let matches = Self::build_cli().get_matches();
        Self::from_matches(&matches, |name| std::env::var(name).ok())
    }

    /// Load from already-parsed CLI arguments and an environment lookup
    pub fn from_matches<F>(matches: &ArgMatches, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match matches.get_one::<String>("config") {
            Some(config_path) => Self::load_from_file(config_path)?,
            None => Self::default(),
        };

        config.apply_env_overrides(env);
        config.apply_cli_overrides(matches);
        config.validate()?;
        Ok(config)
    }

    /// Log the effective configuration; call once logging is initialized
    pub fn log_summary(&self) {
        if let Some(path) = &self.source_file {
            info!("Configuration loaded from file: {}", path);
        }
        info!(
            "Proxying bucket '{}' at {} (token cache: {}, edge cache: {}, diagnostics: {})",
            self.storage.bucket,
            self.storage.endpoint,
            self.credentials.cache_tokens,
            self.edge_cache.enabled,
            self.diagnostics.enabled
        );
        if self.connection_pool.keepalive_enabled {
            info!(
                "Connection keepalive enabled (idle_timeout: {}s, max_idle_per_host: {})",
                self.connection_pool.idle_timeout.as_secs(),
                self.connection_pool.max_idle_per_host
            );
        } else {
            info!("Connection keepalive disabled");
        }
        debug!("Configuration: {:?}", self);
    }

    /// Build CLI argument parser
    pub fn build_cli() -> Command {
        Command::new("gcs-signed-cache")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Authenticating edge proxy for private Google Cloud Storage buckets")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path"),
            )
            .arg(
                Arg::new("http-port")
                    .long("http-port")
                    .value_name("PORT")
                    .help("HTTP port (default: 8080)"),
            )
            .arg(
                Arg::new("bucket")
                    .long("bucket")
                    .value_name("NAME")
                    .help("Storage bucket to proxy"),
            )
            .arg(
                Arg::new("log-level")
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level: trace, debug, info, warn, error (default: info)"),
            )
            .arg(
                Arg::new("diagnostics-enabled")
                    .long("diagnostics-enabled")
                    .action(clap::ArgAction::SetTrue)
                    .help("Allow the policy debug header"),
            )
            .arg(
                Arg::new("no-token-cache")
                    .long("no-token-cache")
                    .action(clap::ArgAction::SetTrue)
                    .help("Exchange a fresh access token for every request"),
            )
            .arg(
                Arg::new("no-edge-cache")
                    .long("no-edge-cache")
                    .action(clap::ArgAction::SetTrue)
                    .help("Disable the in-memory edge cache"),
            )
    }

    /// Load configuration from YAML file
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to read config file {}: {}", path, e))
        })?;

        let mut config: Self = serde_yaml::from_str(&content).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to parse config file {}: {}", path, e))
        })?;
        config.source_file = Some(path.to_string());
        Ok(config)
    }

    /// Apply environment variable overrides read through `env`
    pub fn apply_env_overrides<F>(&mut self, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bucket) = env("GCS_BUCKET") {
            self.storage.bucket = bucket;
        }

        if let Some(key_json) = env("GCS_JSON") {
            self.credentials.key_json = Some(key_json);
        }

        if let Some(key_file) = env("GCS_KEY_FILE") {
            self.credentials.key_file = Some(pathbuf_serde::expand_tilde(&key_file));
        }

        if let Some(email) = env("GCS_SERVICE_ACCOUNT_EMAIL") {
            self.credentials.service_account_email = Some(email);
        }

        if let Some(endpoint) = env("GCS_ENDPOINT") {
            self.storage.endpoint = endpoint;
        }

        if let Some(token_uri) = env("GCS_TOKEN_URI") {
            self.credentials.token_uri = Some(token_uri);
        }

        if let Some(port) = env("HTTP_PORT") {
            if let Ok(port) = port.parse() {
                self.server.http_port = port;
            }
        }

        if let Some(log_level) = env("LOG_LEVEL") {
            self.logging.log_level = log_level;
        }

        if let Some(enabled) = env("TOKEN_CACHE_ENABLED") {
            self.credentials.cache_tokens = parse_flag(&enabled);
        }

        if let Some(enabled) = env("EDGE_CACHE_ENABLED") {
            self.edge_cache.enabled = parse_flag(&enabled);
        }

        if let Some(enabled) = env("DIAGNOSTICS_ENABLED") {
            self.diagnostics.enabled = parse_flag(&enabled);
        }

        if let Some(max_requests) = env("MAX_CONCURRENT_REQUESTS") {
            if let Ok(max_requests) = max_requests.parse() {
                self.server.max_concurrent_requests = max_requests;
            }
        }
    }

    fn apply_cli_overrides(&mut self, matches: &ArgMatches) {
        if let Some(port) = matches.get_one::<String>("http-port") {
            if let Ok(port) = port.parse() {
                self.server.http_port = port;
            }
        }

        if let Some(bucket) = matches.get_one::<String>("bucket") {
            self.storage.bucket = bucket.clone();
        }

        if let Some(log_level) = matches.get_one::<String>("log-level") {
            self.logging.log_level = log_level.clone();
        }

        if matches.get_flag("diagnostics-enabled") {
            self.diagnostics.enabled = true;
        }

        if matches.get_flag("no-token-cache") {
            self.credentials.cache_tokens = false;
        }

        if matches.get_flag("no-edge-cache") {
            self.edge_cache.enabled = false;
        }
    }

    /// Validate every section; the first problem becomes a `ConfigError`
    pub fn validate(&self) -> Result<()> {
        let sections: [(&str, std::result::Result<(), String>); 6] = [
            ("server", self.server.validate()),
            ("storage", self.storage.validate()),
            ("credentials", self.credentials.validate()),
            ("diagnostics", self.diagnostics.validate()),
            ("edge cache", self.edge_cache.validate()),
            ("connection pool", self.connection_pool.validate()),
        ];

        for (section, outcome) in sections {
            if let Err(e) = outcome {
                return Err(ProxyError::ConfigError(format!(
                    "Invalid {} configuration: {}",
                    section, e
                )));
            }
        }
        Ok(())
    }
}
