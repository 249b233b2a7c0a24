//! Logging Module
//!
//! Application logging through `tracing`: a compact console layer, an optional
//! daily-rolling file layer tagged with the host name, and one access line per
//! request on the `access` target.

use crate::config::LoggingConfig;
use crate::{ProxyError, Result};
use std::time::Duration;
use tracing::{debug, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Target used for per-request access lines
pub const ACCESS_LOG_TARGET: &str = "access";

/// One completed request
#[derive(Debug, Clone)]
pub struct AccessLogEntry {
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    /// Asset kind the path was classified as, `-` when unmatched
    pub asset: String,
    pub duration: Duration,
    /// Edge cache outcome header, `-` when the cache was not consulted
    pub edge_cache: String,
}

impl AccessLogEntry {
    /// Fresh entry with a new request id
    pub fn begin(method: &str, path: &str) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            method: method.to_string(),
            path: path.to_string(),
            status: 0,
            asset: "-".to_string(),
            duration: Duration::ZERO,
            edge_cache: "-".to_string(),
        }
    }

    pub fn emit(&self) {
        info!(
            target: ACCESS_LOG_TARGET,
            request_id = %self.request_id,
            method = %self.method,
            path = %self.path,
            status = self.status,
            asset = %self.asset,
            duration_ms = self.duration.as_millis() as u64,
            edge_cache = %self.edge_cache,
            "{} {} {}",
            self.method,
            self.path,
            self.status
        );
    }
}

/// Logger manager for handling all logging operations
pub struct LoggerManager {
    pub config: LoggingConfig,
    pub hostname: String,
}

impl LoggerManager {
    pub fn new(config: LoggingConfig, hostname: String) -> Self {
        Self { config, hostname }
    }

    /// Filter from `RUST_LOG`, falling back to the configured level
    pub fn env_filter(&self) -> Result<EnvFilter> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        let mut filter = EnvFilter::try_new(&self.config.log_level).map_err(|e| {
            ProxyError::ConfigError(format!(
                "Invalid log level '{}': {}",
                self.config.log_level, e
            ))
        })?;
        if !self.config.access_log {
            filter = filter.add_directive(
                format!("{}=off", ACCESS_LOG_TARGET)
                    .parse()
                    .map_err(|e| ProxyError::ConfigError(format!("Invalid log directive: {}", e)))?,
            );
        }
        Ok(filter)
    }

    /// Install the global subscriber
    pub fn initialize(&self) -> Result<()> {
        let env_filter = self.env_filter()?;

        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(true)
            .with_target(false)
            .with_level(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .compact();

        let file_layer = match &self.config.app_log_dir {
            Some(dir) => {
                let host_log_dir = dir.join(&self.hostname);
                std::fs::create_dir_all(&host_log_dir).map_err(|e| {
                    ProxyError::IoError(format!("Failed to create app log directory: {}", e))
                })?;
                let file_appender =
                    RollingFileAppender::new(Rotation::DAILY, host_log_dir, "gcs-signed-cache.log");
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(file_appender)
                        .with_ansi(false)
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_level(true)
                        .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                        .compact()
                        .boxed(),
                )
            }
            None => None,
        };

        // Don't fail if a subscriber is already set (tests)
        let result = tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(console_layer)
            .try_init();

        match result {
            Ok(_) => {
                info!("Application logging initialized for host: {}", self.hostname);
                if let Some(dir) = &self.config.app_log_dir {
                    info!("Application logs will be written to: {:?}", dir.join(&self.hostname));
                }
            }
            Err(_) => debug!("Tracing subscriber already initialized, skipping"),
        }

        Ok(())
    }
}
