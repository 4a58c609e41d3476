use anyhow::Result;
use clap::Parser;
use inference_gateway::{GatewayConfig, InferenceGateway};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gateway")]
#[command(about = "Inference gateway - routes completion requests across a dynamic node pool")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port for the client API and worker back-channel
    #[arg(long, default_value = "8080", env = "PORT")]
    port: u16,

    /// Oracle base URL (overrides ORACLE_URL)
    #[arg(long)]
    oracle_url: Option<String>,

    /// Comma-separated seed node URLs (overrides STATIC_NODE_URLS)
    #[arg(long)]
    static_nodes: Option<String>,

    /// Log filter, e.g. "info" or "inference_gateway=debug"
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let mut config = GatewayConfig::from_env();
    if let Some(oracle_url) = args.oracle_url {
        config.oracle_url = Some(oracle_url);
    }
    if let Some(static_nodes) = args.static_nodes {
        config.static_node_urls = static_nodes
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }

    let gateway = Arc::new(InferenceGateway::new(config)?);
    gateway.start().await?;

    let app = gateway.router();
    let addr = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("gateway listening on http://{addr}");

    let shutdown_gateway = Arc::clone(&gateway);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received, draining");
            shutdown_gateway.shutdown().await;
        })
        .await?;

    Ok(())
}
