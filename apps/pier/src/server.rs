use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use pier_core::{SessionRegistry, SignalingService};
use tokio::signal;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{config::ServerConfig, duplex, http};

pub struct AppState {
    pub service: SignalingService,
    pub metrics: PrometheusHandle,
    pub stream_lifetime: Duration,
}

impl AppState {
    pub fn new(service: SignalingService, metrics: PrometheusHandle, stream_lifetime: Duration) -> Self {
        Self {
            service,
            metrics,
            stream_lifetime,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        self.service.registry()
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(http::health_handler))
        .route("/metrics", get(http::metrics_handler))
        .route("/debug/stats", get(http::stats_handler))
        .route("/sessions/:session_id", get(http::session_status_handler))
        .route("/apiv1/stream", get(duplex::stream_handler))
        .route("/apiv1/:command", post(http::command_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let registry = SessionRegistry::new(config.registry.clone());
    let reaper_handle = registry.spawn_reaper();
    let state = Arc::new(AppState::new(
        SignalingService::new(registry),
        metrics,
        config.stream_lifetime(),
    ));

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(listen_addr = %config.listen_addr, "pier listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    reaper_handle.abort();
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
