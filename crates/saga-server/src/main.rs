//! Saga server - live view of worker sessions over HTTP and WebSocket.

use anyhow::Result;
use clap::Parser;
use saga_server::logging::{self, LogConfig, LogFormat};
use saga_server::{app, config::Config, state::AppState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// Saga server - worker session monitor.
#[derive(Parser, Debug)]
#[command(name = "saga-server")]
#[command(about = "HTTP/WebSocket server streaming Saga worker sessions")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override port from config
    #[arg(short, long)]
    port: Option<u16>,

    /// Project root containing the .saga directory
    #[arg(short = 'r', long, value_name = "DIR")]
    saga_root: Option<PathBuf>,

    /// Enable verbose logging (INFO level for most targets)
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug logging (DEBUG level, excludes ping traces)
    #[arg(short, long)]
    debug: bool,

    /// Enable trace logging (TRACE level for everything)
    #[arg(long)]
    trace: bool,

    /// Quiet mode (WARN and ERROR only)
    #[arg(short, long)]
    quiet: bool,

    /// Set log level for specific targets (e.g., "poller=debug" or "ws::ping=trace").
    /// Can be specified multiple times. Targets are prefixed with "saga::" automatically.
    #[arg(long = "log", value_name = "TARGET=LEVEL")]
    log_overrides: Vec<String>,

    /// Log output format
    #[arg(long = "log-format", value_name = "FORMAT", default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = LogConfig::from_cli(
        cli.verbose,
        cli.debug,
        cli.trace,
        cli.quiet,
        cli.log_overrides,
        cli.log_format,
    );
    logging::init(&log_config);

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(saga_root) = cli.saga_root {
        config.saga_root = saga_root;
    }

    tracing::info!(
        target: "saga::startup",
        "Loaded configuration (port: {}, saga root: {}, output dir: {})",
        config.port,
        config.saga_root.display(),
        config.output_dir.display()
    );

    let state = Arc::new(AppState::new(config.clone()));
    let background = state.start_background();
    tracing::info!(target: "saga::startup", "Started session polling");

    let app = app::router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!(target: "saga::startup", "Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    background.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(target: "saga::startup", "Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!(target: "saga::startup", "Shutting down");
}
