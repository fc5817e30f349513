mod chatwoot;
mod config;
mod error;
mod llm;
mod retry;
mod server;
mod webhook;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::server::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; real deployments set the environment directly.
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,wootbot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Model: {}", config.llm.model);
    info!("  Completion API: {}", config.llm.base_url);
    info!("  Chatwoot: {}", config.chatwoot.base_url);
    info!(
        "  System prompt: {}",
        if config.llm.system_prompt.is_some() { "on" } else { "off" }
    );
    info!("  Browser User-Agent: {}", config.chatwoot.browser_user_agent);

    let state = Arc::new(AppState::new(config)?);

    server::run(state).await
}
