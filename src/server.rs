use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    routing::{any, get},
    Json, Router,
};
use tracing::info;

use crate::chatwoot::ChatwootClient;
use crate::config::Config;
use crate::llm::LlmClient;
use crate::retry::{RetryPolicy, Sleeper, TokioSleeper};
use crate::webhook::{handle_webhook, StatusBody};

/// Shared, read-only state handed to every webhook invocation.
pub struct AppState {
    pub config: Config,
    pub llm: LlmClient,
    pub chatwoot: ChatwootClient,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        Self::with_sleeper(config, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(config: Config, sleeper: Arc<dyn Sleeper>) -> Result<Self> {
        let llm = LlmClient::new(config.llm.clone())?;
        let chatwoot = ChatwootClient::new(
            config.chatwoot.clone(),
            RetryPolicy::from(&config.retry),
            sleeper,
        )?;
        Ok(Self {
            config,
            llm,
            chatwoot,
        })
    }
}

async fn health() -> Json<StatusBody> {
    Json(StatusBody { status: "ok" })
}

/// The webhook route takes any method so non-POST requests get a JSON 405.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/webhook", any(handle_webhook))
        .route("/health", get(health))
        .with_state(state)
}

/// Serve until Ctrl-C.
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let addr = state.config.server.listen_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    info!("Listening for Chatwoot webhooks on http://{addr}/api/webhook");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("Server error")?;

    Ok(())
}
