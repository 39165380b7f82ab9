use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dockgate::auth::GoogleProvider;
use dockgate::config::Config;
use dockgate::db::Store;
use dockgate::docker::{BollardFacade, DockerFacade};
use dockgate::server::{AppState, GatewayServer, GatewayServerConfig, build_router};

#[derive(Debug, Parser)]
#[command(name = "dockgate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Port to listen on (overrides PORT).
    #[arg(short, long)]
    port: Option<u16>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,

    /// Load environment variables from this file instead of `.env`.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.env_file {
        Some(path) => {
            dotenvy::from_path(path)
                .with_context(|| format!("Failed to load {}", path.display()))?;
        }
        None => {
            let _ = dotenvy::dotenv();
        }
    }

    init_tracing(cli.log_json);
    run(cli).await
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "dockgate=info,tower_http=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::from_env().context("Invalid configuration")?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    info!(env = ?config.app_env, port = config.port, "Starting dockgate");

    std::fs::create_dir_all(&config.data_dir).with_context(|| {
        format!("Failed to create data directory {}", config.data_dir.display())
    })?;
    std::fs::create_dir_all(&config.volume_dir).with_context(|| {
        format!("Failed to create volume directory {}", config.volume_dir.display())
    })?;

    let store = Store::open(config.db_path())
        .await
        .context("Failed to open database")?;
    store
        .seed_admin(&config.admin_email)
        .await
        .context("Failed to seed admin user")?;

    let docker = BollardFacade::connect(config.host_volume_dir.clone())
        .context("Failed to create Docker client")?;
    if let Err(e) = docker.ping().await {
        warn!(error = %e, "Docker daemon not reachable yet");
    }

    let identity = Arc::new(GoogleProvider::new(config.oauth.clone()));
    let server_config = GatewayServerConfig {
        addr: config.listen_addr(),
        tls: if config.is_production() {
            config.tls.clone()
        } else {
            None
        },
    };

    let state = AppState::new(config, store, Arc::new(docker), identity);
    let router = build_router(state)?;

    let mut server = GatewayServer::new(server_config);
    server.add_routes(router);
    server.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    server.shutdown().await;
    Ok(())
}
