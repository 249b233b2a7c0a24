use gcs_signed_cache::{
    config::Config,
    handler::RequestHandler,
    http_proxy::HttpProxy,
    logging::LoggerManager,
    shutdown::{ShutdownCoordinator, ShutdownSignal},
    transport::HyperTransport,
    ProxyError, Result,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("gcs-signed-cache exiting: {}", e);
        eprintln!("gcs-signed-cache: {}", e);
        // Configuration problems are distinguished from runtime failures
        std::process::exit(if e.is_fatal() { 2 } else { 1 });
    }
}

async fn run() -> Result<()> {
    let config = Config::load()?;

    let hostname = gethostname::gethostname().to_string_lossy().to_string();
    let logger = LoggerManager::new(config.logging.clone(), hostname);
    logger.initialize()?;

    info!("Starting gcs-signed-cache v{}", env!("CARGO_PKG_VERSION"));
    config.log_summary();

    // Key problems are fatal at startup, never per request
    let key = config.credentials.load_key()?;
    info!("Signing as service account {}", key.client_email());

    let transport = Arc::new(HyperTransport::new(
        &config.connection_pool,
        config.storage.upstream_timeout,
    )?);
    let handler = Arc::new(RequestHandler::from_config(&config, key, transport)?);

    let bind_ip: IpAddr = config.server.bind_address.parse().map_err(|e| {
        ProxyError::ConfigError(format!(
            "Invalid bind address '{}': {}",
            config.server.bind_address, e
        ))
    })?;
    let http_addr = SocketAddr::new(bind_ip, config.server.http_port);
    let http_proxy = HttpProxy::new(
        http_addr,
        Arc::clone(&handler),
        config.server.max_concurrent_requests,
        config.server.request_timeout,
    );

    let mut shutdown_coordinator = ShutdownCoordinator::new(config.server.shutdown_timeout);
    shutdown_coordinator.track_requests(
        http_proxy.semaphore(),
        http_proxy.max_concurrent_requests(),
    );
    let http_shutdown = ShutdownSignal::new(shutdown_coordinator.subscribe());

    let http_task = tokio::spawn(async move { http_proxy.start(http_shutdown).await });

    let shutdown_task = tokio::spawn(async move {
        if let Err(e) = shutdown_coordinator.listen_for_shutdown().await {
            error!("Graceful shutdown incomplete: {}", e);
        }
    });

    match http_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!("HTTP proxy failed: {}", e);
            return Err(e);
        }
        Err(e) => {
            return Err(ProxyError::SystemError(format!("HTTP proxy task panicked: {}", e)));
        }
    }

    shutdown_task.await.ok();

    if let Some(cache) = handler.edge_cache() {
        let stats = cache.stats();
        info!(
            "Edge cache at shutdown: {} entries, {} hits, {} misses, {} evictions",
            stats.entries, stats.hits, stats.misses, stats.evictions
        );
    }
    info!("gcs-signed-cache shutdown complete");
    Ok(())
}
