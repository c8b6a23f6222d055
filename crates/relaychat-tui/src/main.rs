mod app;
mod handler;
mod highlight;
mod tui;
mod ui;

use std::fs::OpenOptions;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use app::App;
use relaychat_core::{Config, Executor, RelayClient, Renderer};
use tui::AppEvent;

/// Busy indicator frame rate, also how often a finished reply is picked up
const TICK_RATE: Duration = Duration::from_millis(300);

#[derive(Parser)]
#[command(name = "relaychat")]
#[command(about = "Chat with Gemini through a relaychat server", version)]
struct Cli {
    /// Relay server URL
    #[arg(short, long)]
    server: Option<String>,
    /// Request timeout in seconds (0 disables it)
    #[arg(short, long)]
    timeout: Option<u64>,
}

/// Log to a file so the alternate screen stays clean
fn init_logging() -> Result<()> {
    let dir = Config::config_dir()?;
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("relaychat.log");
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging()?;

    let mut config = Config::load()?;
    if let Some(server) = cli.server {
        config.server_url = server;
    }
    if let Some(timeout) = cli.timeout {
        config.timeout_secs = timeout;
    }

    let client = RelayClient::with_timeout(&config.server_url, config.timeout())?;
    let renderer = Renderer::new(Executor::new(config.sandbox.clone()));
    info!(endpoint = %client.endpoint(), "starting chat");

    tui::install_panic_hook();
    let mut terminal = tui::init()?;
    let result = run(&mut terminal, App::new(client, renderer)).await;
    tui::restore()?;
    result
}

async fn run(terminal: &mut tui::Tui, mut app: App) -> Result<()> {
    let mut events = tui::EventHandler::new(TICK_RATE);

    // Every append asks the next draw to scroll to the newest entry
    let tx = events.sender();
    app.conversation.subscribe(move |_, index| {
        let _ = tx.send(AppEvent::Appended(index));
    });

    while !app.should_quit {
        terminal.draw(|frame| ui::render(&mut app, frame))?;

        match events.next().await {
            Some(event) => handler::handle_event(&mut app, event).await?,
            None => break,
        }
    }

    info!(messages = app.conversation.len(), "chat closed");
    Ok(())
}
