mod admin;
mod chat;
mod config;
mod error;
mod imagery;
mod llm;
mod markup;
mod models;
mod page;
mod routes;
mod scenario;

use anyhow::Context;
use std::{net::SocketAddr, sync::Arc};
use tracing_subscriber::{fmt, EnvFilter};

use crate::{
    chat::{ChatSynthesizer, SessionStore},
    config::Config,
    imagery::{ImageCache, ImageGenerator},
    page::PageSynthesizer,
    routes::{router, AppState},
    scenario::ScenarioStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Init tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = Config::from_env().context("invalid configuration")?;
    let model = llm::from_config(&config)?;
    let image_backend = imagery::backend_from_config(&config)?;
    tracing::info!("🧠 Text backend: {}, image backend: {}", model.name(), image_backend.name());

    let scenarios = ScenarioStore::open(&config.scenario_dir, &config.default_scenario)
        .with_context(|| format!("loading scenarios from {}", config.scenario_dir.display()))?;
    tracing::info!(
        "📚 Loaded {} scenarios, active: '{}'",
        scenarios.list().len(),
        scenarios.active_id()
    );

    let cache = ImageCache::new(&config.image_cache_dir, config.image_cache_max_entries);
    let state = AppState {
        scenarios: Arc::new(scenarios),
        pages: Arc::new(PageSynthesizer::new(model.clone(), config.page_options, config.browse_budget)),
        images: Arc::new(ImageGenerator::new(image_backend, cache)),
        chat: Arc::new(ChatSynthesizer::new(model, config.chat_options, config.chat_budget)),
        sessions: Arc::new(SessionStore::new(config.chat_max_sessions)),
    };

    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%addr, "Starting server");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("👋 Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("❌ Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("🛑 Shutdown requested");
}
