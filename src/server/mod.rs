//! HTTP API for pavement condition inference.
//!
//! Provides endpoints for single and batch prediction, registry
//! inspection, and production rollout.

pub mod routes;
pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::backend::backend_name;
use crate::config::ServingConfig;
use crate::error::Result;
use crate::inference::InferenceService;
use crate::registry::ModelRegistry;

use self::state::{AppState, SharedState};

/// Build the application router over shared state.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        // Inference
        .route("/predict", post(routes::predict))
        .route("/predict_batch", post(routes::predict_batch))
        // Registry
        .route("/models", get(routes::list_models))
        .route("/admin/production", post(routes::set_production))
        // Health
        .route("/health", get(routes::health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// Run the server until the process is stopped.
pub async fn serve(registry: ModelRegistry, config: ServingConfig) -> Result<()> {
    config.validate()?;
    let host = config.host.clone();
    let port = config.port;

    let service = Arc::new(InferenceService::new(registry, config));
    if let Ok(Some(version)) = service.production_version() {
        // Warm the production model so the first request is not slow.
        if let Err(err) = service.predictor(Some(&version)) {
            tracing::warn!(version, error = %err, "failed to preload production model");
        }
    } else {
        tracing::warn!("no production model set; set one via POST /admin/production");
    }

    let state = Arc::new(AppState::new(service));
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| crate::error::PavementError::Config(format!("invalid bind address: {e}")))?;
    info!("serving on http://{} ({})", addr, backend_name());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
