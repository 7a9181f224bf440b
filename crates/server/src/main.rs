use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

mod api;
mod config;
mod simulation;
mod websocket;

use config::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "flowrun")]
#[command(about = "Flowrun - dependency-driven workflow graph execution engine", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "flowrun.toml", env = "FLOWRUN_CONFIG")]
    config: PathBuf,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowrun=info,tower_http=debug".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();

    tracing::info!("Starting Flowrun workflow engine");

    // Load configuration
    let config = ServerConfig::load(&args.config)?;

    // Start API server
    let addr = format!("{}:{}", args.host, args.port);
    tracing::info!("Starting API server on {}", addr);

    api::serve(&addr, config).await?;

    Ok(())
}
