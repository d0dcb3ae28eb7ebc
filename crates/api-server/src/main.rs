//! API server for the dagrun execution control plane
//!
//! Serves the REST API for launching and terminating pipeline runs.

mod config;
mod routes;
mod state;

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use worker_runner::{CancelOutcome, ProcessLauncher};

use crate::config::ServerConfig;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "api_server=debug,worker_runner=debug,dagrun_core=info,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env()?;
    tracing::info!("Worker directory: {:?}", config.worker_dir);

    let launcher = match &config.pipelines {
        Some(path) => {
            tracing::info!("Loading pipeline catalog from {:?}", path);
            ProcessLauncher::from_catalog_file(path, config.worker_dir.clone())
                .with_context(|| format!("failed to load pipeline catalog {:?}", path))?
        }
        None => {
            tracing::warn!("No pipeline catalog configured, every launch will be rejected");
            ProcessLauncher::new(config.worker_dir.clone())
        }
    };
    tracing::info!("Pipelines: {:?}", launcher.pipeline_names());

    let app_state = AppState::new(Arc::new(launcher));
    let executor = app_state.executor_arc();

    let app = Router::new()
        .merge(routes::health::router())
        .merge(routes::executions::router())
        .with_state(app_state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!("REST API listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Workers outlive the HTTP server otherwise.
    for (run_id, outcome) in executor.cancel_all().await {
        match outcome {
            Ok(CancelOutcome::Success) => tracing::info!("Canceled run {} on shutdown", run_id),
            Ok(other) => tracing::debug!("Run {} not canceled on shutdown: {:?}", run_id, other),
            Err(e) => tracing::error!("Failed to cancel run {} on shutdown: {}", run_id, e),
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
