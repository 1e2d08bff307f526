mod cli_args;
mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use extman_controller::{ControllerConfig, ExtensionController};
use extman_extensions::DirectoryModuleRepository;
use extman_gateway::{GatewayConfig, RestServer, SqliteConnectorProvider};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

use crate::cli_args::Cli;
use crate::config::RuntimeSettings;

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let settings = RuntimeSettings::from_cli(&cli)?;
    std::fs::create_dir_all(&settings.database_dir).with_context(|| {
        format!(
            "failed to create database directory {}",
            settings.database_dir.display()
        )
    })?;
    tracing::info!(
        extensions_dir = %settings.extensions_dir.display(),
        database_dir = %settings.database_dir.display(),
        bucketfs_base_path = %settings.bucketfs_base_path,
        "starting extension manager"
    );

    let repository = DirectoryModuleRepository::new(&settings.extensions_dir);
    let controller = ExtensionController::new(
        Arc::new(repository),
        ControllerConfig {
            bucketfs_base_path: settings.bucketfs_base_path.clone(),
        },
    );
    let server = RestServer::new(
        controller,
        Arc::new(SqliteConnectorProvider::new(&settings.database_dir)),
        GatewayConfig {
            bind: settings.bind,
            request_timeout: settings.request_timeout,
        },
    );
    let running = server.start().await?;
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");
    running.stop().await
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    run(Cli::parse()).await
}
