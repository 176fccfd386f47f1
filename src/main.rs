use std::sync::Arc;

use clap::Parser;
use colored::*;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vibe_relay::cli::Args;
use vibe_relay::config::RelayConfig;
use vibe_relay::web::{self, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vibe_relay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = RelayConfig::from_args(&args)?;

    if args.print_config {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let state = Arc::new(AppState::from_config(&config)?);
    let listener = TcpListener::bind(config.bind_addr()).await?;
    let addr = listener.local_addr()?;

    eprintln!(
        "{}",
        format!("  Vibe relay listening on http://{}", addr).bright_green()
    );
    eprintln!(
        "{}",
        format!(
            "  {} concurrent chats, {} models, {} transcripts",
            config.queue.max_concurrent,
            config.models.general.len() + config.models.coder.len(),
            config.storage.backend
        )
        .bright_blue()
    );
    eprintln!("{}", "  Press Ctrl+C to stop.".bright_blue());

    let shutdown_state = Arc::clone(&state);
    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_state.orchestrator.queue().close();
    };

    web::serve(listener, state, shutdown, config.server.shutdown_grace()).await?;
    info!("relay stopped");
    Ok(())
}
