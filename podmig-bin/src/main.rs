use std::sync::Arc;

use color_eyre::eyre;
use podmig_checkpoint::{ConvergencePolicy, PreDumpDriver, RuncCheckpointTool, RuncConfig};
use podmig_common::InMemoryPodRegistry;
use podmig_coordinator::{
    create_router, AppState, MigrationClient, MigrationManager, NodeConfig, PreDumpSyncPath,
};
use tracing::{info, warn};

// --- Node daemon setup ---

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,podmig=debug")),
        )
        .init();

    info!("Starting pod migration node service...");
    let config = NodeConfig::from_env()?;
    info!(?config, "Configuration loaded");

    let registry = Arc::new(match &config.pods_file {
        Some(path) => InMemoryPodRegistry::load_from_file(path).await?,
        None => {
            warn!("PODMIG_PODS_FILE not set, serving an empty pod inventory");
            InMemoryPodRegistry::new()
        }
    });

    let tool = Arc::new(RuncCheckpointTool::new(RuncConfig {
        binary: config.runc_binary.clone(),
        root: config.runc_root.clone(),
        ..Default::default()
    }));
    let driver = Arc::new(PreDumpDriver::new(tool, ConvergencePolicy::default()));
    let sync_path = Arc::new(PreDumpSyncPath::new(
        driver,
        config.max_pre_dump_iterations,
        config.release_timeout,
    ));

    let manager = Arc::new(MigrationManager::new(&config, registry.clone(), sync_path));
    let client = Arc::new(MigrationClient::new(&config, registry.clone())?);
    let app = create_router(AppState {
        manager,
        client,
        pods: registry,
    });

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!(addr = %config.listen_addr, migration_root = %config.migration_root().display(), "Migration endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Pod migration node service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
