//! Graceful Shutdown Module
//!
//! Handles signal handling, stopping the accept loop, and waiting (bounded by the
//! shutdown timeout) for in-flight requests to complete.

use crate::{ProxyError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{broadcast, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// In-flight request permits the coordinator drains on shutdown
struct RequestPermits {
    semaphore: Arc<Semaphore>,
    capacity: u32,
}

/// Shutdown coordinator for graceful system shutdown
pub struct ShutdownCoordinator {
    requests: Option<RequestPermits>,
    shutdown_sender: broadcast::Sender<()>,
    shutdown_timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create new shutdown coordinator
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (shutdown_sender, _) = broadcast::channel(16);

        Self {
            requests: None,
            shutdown_sender,
            shutdown_timeout,
        }
    }

    /// Wait for the server's request semaphore to be fully released on shutdown
    pub fn track_requests(&mut self, semaphore: Arc<Semaphore>, capacity: usize) {
        self.requests = Some(RequestPermits {
            semaphore,
            capacity: u32::try_from(capacity).unwrap_or(u32::MAX),
        });
    }

    /// Get shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_sender.subscribe()
    }

    /// Wait for SIGINT or SIGTERM, then shut down
    pub async fn listen_for_shutdown(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        let mut sigint =
            signal::unix::signal(signal::unix::SignalKind::interrupt()).map_err(|e| {
                ProxyError::SystemError(format!("Failed to create SIGINT handler: {}", e))
            })?;

        let mut sigterm =
            signal::unix::signal(signal::unix::SignalKind::terminate()).map_err(|e| {
                ProxyError::SystemError(format!("Failed to create SIGTERM handler: {}", e))
            })?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
        }

        self.initiate_shutdown().await
    }

    /// Stop accepting connections and wait for in-flight requests
    pub async fn initiate_shutdown(&self) -> Result<()> {
        info!("Initiating graceful shutdown sequence");

        if let Err(e) = self.shutdown_sender.send(()) {
            debug!("Shutdown signal not sent (no active receivers): {}", e);
        }

        let Some(requests) = &self.requests else {
            info!("Graceful shutdown completed successfully");
            return Ok(());
        };

        match timeout(
            self.shutdown_timeout,
            requests.semaphore.acquire_many(requests.capacity),
        )
        .await
        {
            Ok(_) => {
                info!("All in-flight requests completed; shutdown complete");
                Ok(())
            }
            Err(_) => {
                let remaining = (requests.capacity as usize).saturating_sub(requests.semaphore.available_permits());
                warn!(
                    "Shutdown timeout ({:?}) exceeded with {} requests still in flight",
                    self.shutdown_timeout, remaining
                );
                Err(ProxyError::TimeoutError(format!(
                    "{} requests still in flight after {:?}",
                    remaining, self.shutdown_timeout
                )))
            }
        }
    }
}

/// Shutdown signal wrapper for components
pub struct ShutdownSignal {
    receiver: broadcast::Receiver<()>,
}

impl ShutdownSignal {
    /// Create new shutdown signal from receiver
    pub fn new(receiver: broadcast::Receiver<()>) -> Self {
        Self { receiver }
    }

    /// Wait for shutdown signal; a closed or lagged channel also counts
    pub async fn wait_for_shutdown(&mut self) {
        let _ = self.receiver.recv().await;
    }
}
