use anyhow::Context;

use brewbuddy_api::state::AppState;
use brewbuddy_api::{app, config, storage};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present so cargo run picks up DATABASE_URL, ANTHROPIC_API_KEY, etc.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = config::config();
    tracing::info!("Starting BrewBuddy API in {:?} mode", config.environment);

    if config.is_production() && config.vision.api_key.is_none() {
        anyhow::bail!("ANTHROPIC_API_KEY must be set in production");
    }

    let store = storage::connect(config)
        .await
        .context("database connection failed")?;
    store
        .initialize()
        .await
        .context("schema initialization failed")?;

    let app = app(AppState::new(store, config));

    let bind_addr = format!("0.0.0.0:{}", config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    println!("🚀 BrewBuddy API listening on http://{bind_addr}");

    axum::serve(listener, app).await.context("server")?;

    Ok(())
}
