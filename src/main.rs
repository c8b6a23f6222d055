use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use relaychat::create_router;
use relaychat_core::{Config, GeminiClient, Relay};

#[derive(Parser)]
#[command(name = "relaychat-server")]
#[command(about = "Relay chat prompts to Gemini over HTTP", version)]
struct Cli {
    /// Address to listen on
    #[arg(short, long)]
    bind: Option<String>,
    /// Gemini model to use
    #[arg(short, long)]
    model: Option<String>,
    /// Upstream request timeout in seconds (0 disables it)
    #[arg(short, long)]
    timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = Config::load()?;
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if let Some(model) = cli.model {
        config.model = model;
    }
    if let Some(timeout) = cli.timeout {
        config.timeout_secs = timeout;
    }

    if config.gemini_api_key.is_none() {
        warn!("GEMINI_API_KEY is not set; generate requests will fail");
    }

    let client = GeminiClient::from_config(&config)?;
    info!(model = %client.model(), "using Gemini");
    let app = create_router(Relay::new(Arc::new(client)));

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    info!("relaychat-server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutting down");
    }
}
