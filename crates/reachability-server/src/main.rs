//! Reachability monitor server binary

use reachability_server::{
    Config, FileRegistry, JsonLinesConnector, MonitorServer, setup_tracing,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> common::Result<()> {
    // Tracing is not up yet, so config problems go to stderr
    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            eprintln!("Using default configuration");
            Config::default()
        }
    };

    let _telemetry_guard = setup_tracing(&config.telemetry, &config.logging)?;
    tracing::info!("Reachability server starting");

    let server_config = config.to_server_config();

    let registry = FileRegistry::new(&server_config.hosts_file);
    if server_config.seed_default_hosts {
        registry.seed_defaults().await?;
    }
    let connector =
        JsonLinesConnector::new(&server_config.results_file, server_config.store_lock_wait);

    let server = MonitorServer::new(server_config, Arc::new(registry), Arc::new(connector));

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Received Ctrl-C");
                    shutdown.cancel();
                }
                Err(e) => tracing::warn!(error = %e, "Failed to listen for Ctrl-C"),
            }
        }
    });

    server.run(shutdown).await;

    // Telemetry guard flushes spans on drop
    Ok(())
}
