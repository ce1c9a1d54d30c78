use clap::Parser;
use corsway::config::Config;
use corsway::logging;
use corsway::proxy_service::ProxyEngine;
use corsway::server;
use mimalloc::MiMalloc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    logging::init(config.log_format)?;

    let options = config.proxy_options().map_err(|e| {
        error!(error = %e, "Invalid configuration");
        e
    })?;
    info!(
        whitelist = options.origin_whitelist.len(),
        blacklist = options.origin_blacklist.len(),
        rate_limit = ?options.rate_limit,
        allow_private_targets = options.allow_private_targets,
        "Configuration loaded"
    );

    let listener = TcpListener::bind(config.listen).await.map_err(|e| {
        error!(addr = %config.listen, error = %e, "Failed to bind listener");
        e
    })?;
    info!(addr = %config.listen, "Corsway listening");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
        }
        signal.cancel();
    });

    server::serve(listener, ProxyEngine::new(options), shutdown)
        .await
        .map_err(|e| {
            error!(error = %e, "Server error");
            e
        })?;

    info!("Shutdown complete");
    Ok(())
}
