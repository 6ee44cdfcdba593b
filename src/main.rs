use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use duckhouse::config::Config;
use duckhouse::engine;
use duckhouse::gateway::{GatewayState, start_server};
use duckhouse::logging;
use duckhouse::tenant::{RegistryCell, RegistryConfig};

#[derive(Parser)]
#[command(name = "duckhouse")]
#[command(about = "Per-tenant DuckDB connection service")]
#[command(version)]
struct Cli {
    /// TOML settings file
    #[arg(long, env = "DUCKHOUSE_CONFIG")]
    config: Option<PathBuf>,

    /// Operator API bind host
    #[arg(long)]
    host: Option<String>,

    /// Operator API port
    #[arg(long)]
    port: Option<u16>,

    /// Skip installing engine extensions at startup
    #[arg(long)]
    skip_prepare: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let mut config = Config::from_env(cli.config.as_deref())?;
    if let Some(host) = cli.host {
        config.gateway.host = host;
    }
    if let Some(port) = cli.port {
        config.gateway.port = port;
    }

    logging::init(&config.logging)?;

    let cell = Arc::new(RegistryCell::new(engine::default_engine()?));
    if cli.skip_prepare {
        tracing::info!("Skipping engine extension install");
    } else {
        cell.prepare_engine().await?;
    }

    let Config {
        engine: engine_config,
        storage,
        catalog,
        gateway,
        ..
    } = config;
    cell.init_registry(RegistryConfig {
        engine: engine_config,
        storage,
        catalog,
    });

    let state = Arc::new(GatewayState::new(Arc::clone(&cell)));
    let addr = start_server(gateway.socket_addr()?, Arc::clone(&state)).await?;
    tracing::info!("duckhouse ready on http://{}", addr);

    shutdown_signal().await;
    tracing::info!("Shutdown signal received");

    state.shutdown().await;
    cell.shutdown_registry().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
