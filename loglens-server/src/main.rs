//! LogLens Server - HTTP API for the access-log engine

mod api;

use clap::Parser;
use loglens_core::engine::{EngineConfig, LogEngine};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Command-line arguments
#[derive(Debug, Parser)]
#[command(name = "loglens-server", version, about = "LogLens HTTP server")]
struct Args {
    /// Engine configuration file (TOML)
    #[arg(short, long, env = "LOGLENS_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory, overrides the config file
    #[arg(short, long, env = "LOGLENS_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// HTTP listen address
    #[arg(short, long, env = "LOGLENS_LISTEN", default_value = "0.0.0.0:8087")]
    listen: SocketAddr,

    /// Query timeout in milliseconds, overrides the config file
    #[arg(long, env = "LOGLENS_QUERY_TIMEOUT_MS")]
    query_timeout_ms: Option<u64>,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP listen address
    pub http_addr: SocketAddr,
    /// Engine settings
    pub engine: EngineConfig,
}

impl ServerConfig {
    fn from_args(args: Args) -> anyhow::Result<Self> {
        let mut engine = match &args.config {
            Some(path) => EngineConfig::load(path)?,
            None => EngineConfig::default(),
        };
        if let Some(data_dir) = args.data_dir {
            engine.data_dir = data_dir;
        }
        if let Some(timeout_ms) = args.query_timeout_ms {
            engine.query.timeout_ms = Some(timeout_ms);
        }
        Ok(Self {
            http_addr: args.listen,
            engine,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let config = ServerConfig::from_args(Args::parse())?;

    info!("Starting LogLens server...");
    info!("Data directory: {:?}", config.engine.data_dir);
    info!("HTTP server: http://{}", config.http_addr);

    // Initialize engine
    let engine = Arc::new(LogEngine::open(config.engine.clone())?);

    // Create router
    let app = api::create_router(engine.clone());

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!("LogLens server listening on {}", config.http_addr);

    axum::serve(listener, app).await?;

    engine.sync()?;
    Ok(())
}
