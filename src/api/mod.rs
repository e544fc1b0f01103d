pub mod handlers;
pub mod types;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::algo::registry::AlgorithmRegistry;
use crate::run::orchestrator::Orchestrator;
use crate::run::store::ResultStore;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<AlgorithmRegistry>,
    pub store: Arc<dyn ResultStore>,
    pub orchestrator: Arc<Orchestrator>,
}

pub fn router(
    registry: Arc<AlgorithmRegistry>,
    store: Arc<dyn ResultStore>,
    orchestrator: Arc<Orchestrator>,
) -> Router {
    let state = Arc::new(AppState {
        registry,
        store,
        orchestrator,
    });

    Router::new()
        .route("/api/v1/health", get(handlers::health))
        .route("/api/v1/batches", post(handlers::create_batch))
        .route(
            "/api/v1/strategies",
            post(handlers::create_strategy).get(handlers::list_strategies),
        )
        .route("/api/v1/strategies/{id}", get(handlers::get_strategy))
        .route("/api/v1/runs", post(handlers::create_run))
        .route("/api/v1/runs/{id}", get(handlers::get_run))
        .route("/api/v1/runs/{id}/results", get(handlers::get_run_results))
        .route("/api/v1/runs/{id}/cancel", post(handlers::cancel_run))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

pub async fn serve(
    registry: Arc<AlgorithmRegistry>,
    store: Arc<dyn ResultStore>,
    orchestrator: Arc<Orchestrator>,
    host: &str,
    port: u16,
) -> eyre::Result<()> {
    let app = router(registry, store, orchestrator);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "API server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
