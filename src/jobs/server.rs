use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::api::{self, AppState};
use super::orchestrator::Orchestrator;
use crate::config::Config;

/// Build the full application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub fn app_state(orchestrator: Orchestrator, config: &Config) -> Arc<AppState> {
    Arc::new(AppState {
        orchestrator,
        keepalive: Duration::from_secs(config.server.keepalive_secs.max(1)),
    })
}

/// Start the HTTP server and run until Ctrl+C.
pub async fn start_server(config: &Config) -> Result<()> {
    let orchestrator = Orchestrator::open(config).context("Failed to initialize job orchestrator")?;
    let app = build_router(app_state(orchestrator, config));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "jobforge listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
