//! Updraft server - metadata API and refresh endpoint

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use updraft_lib::engine::api::{create_router, AppState};
use updraft_lib::engine::{Database, Refresher, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "updraft_lib=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env().context("invalid server configuration")?;
    if config.api_key.is_empty() {
        tracing::warn!("API_KEY is empty; protected endpoints will reject every request");
    }
    if config.index_url.is_none() {
        tracing::warn!("INDEX_URL is not set; /scrape will fail until it is configured");
    }

    let db = Database::new(&config.database_path)
        .with_context(|| format!("opening {}", config.database_path.display()))?;
    let refresher = Refresher::new(db, &config);
    let app = create_router(AppState::new(refresher, &config.api_key));

    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(address = %addr, "Updraft server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
