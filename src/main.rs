use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use scan_processor::config::{Command, Config};
use scan_processor::health::HealthServer;
use scan_processor::processor::Processor;
use scan_processor::{logging, storage};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_args();

    // Handle version subcommand
    if let Some(Command::Version) = &config.command {
        println!(
            "scan-processor {}, commit: {}, build_date: {}",
            env!("CARGO_PKG_VERSION"),
            env!("GIT_COMMIT"),
            env!("BUILD_DATE"),
        );
        return Ok(());
    }

    // Initialize logging
    logging::init(&config.log_format, &config.log_level);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        commit = env!("GIT_COMMIT"),
        build_date = env!("BUILD_DATE"),
        backend = %config.storage.db_type(),
        subscription = %config.pubsub.subscription_id(),
        "scan-processor starting"
    );

    let health_server = HealthServer::new();
    if config.health_port != 0 {
        let health_port = config.health_port;
        let health_server_clone = health_server.clone();
        let (health_ready_tx, health_ready_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            if let Err(e) = health_server_clone
                .serve(health_port, health_ready_tx)
                .await
            {
                error!(error = %e, "Health check server failed");
            }
        });

        // Wait for health server to be ready
        health_ready_rx.await.ok();
        info!(port = health_port, "Health check server started");
    }

    if let Err(e) = run(config, health_server).await {
        error!(error = format!("{e:#}"), "Application error");
        std::process::exit(1);
    }

    info!("Shutdown complete");
    Ok(())
}

async fn run(config: Config, health_server: HealthServer) -> Result<()> {
    let store = storage::registry()
        .resolve(&config.storage)
        .await
        .context("failed to initialize storage")?;

    let processor = match Processor::new(&config.pubsub, store.clone()).await {
        Ok(processor) => Arc::new(processor),
        Err(e) => {
            store.close().await;
            return Err(e).context("failed to create processor");
        }
    };

    let readiness = {
        let states = processor.subscribe_state();
        tokio::spawn(async move { health_server.track(states).await })
    };

    let result = processor.start().await;
    store.close().await;
    readiness.abort();

    result.context("processor failed")
}
