//! Route handlers for the inference server.

use axum::{
    extract::{Multipart, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::backend::backend_name;
use crate::error::PavementError;
use crate::inference::{CacheStats, Prediction};
use crate::registry::ArtifactMetadata;

use super::state::SharedState;

/// Map domain errors onto HTTP status codes. Client mistakes are 4xx,
/// everything else is a 500.
fn error_response(err: &PavementError) -> (StatusCode, String) {
    let status = match err {
        PavementError::Decode(_) | PavementError::Dimension(_) | PavementError::Config(_) => {
            StatusCode::BAD_REQUEST
        }
        PavementError::NotFound(_) => StatusCode::NOT_FOUND,
        PavementError::AlreadyExists(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("request failed: {}", err);
    }
    (status, err.to_string())
}

#[derive(Debug, Deserialize, Default)]
pub struct PredictQuery {
    /// Explicit model version; defaults to the production pointer
    pub version: Option<String>,
}

/// POST /predict - Classify one image, uploaded as multipart field "image"
pub async fn predict(
    State(state): State<SharedState>,
    Query(query): Query<PredictQuery>,
    mut multipart: Multipart,
) -> Result<Json<Prediction>, (StatusCode, String)> {
    let mut image: Option<Vec<u8>> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid multipart body: {e}")))?
    {
        if field.name() == Some("image") {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| (StatusCode::BAD_REQUEST, format!("failed to read upload: {e}")))?;
            image = Some(bytes.to_vec());
        }
    }
    let image =
        image.ok_or_else(|| (StatusCode::BAD_REQUEST, "missing \"image\" field".to_string()))?;

    let prediction = match query.version {
        // Explicit versions bypass the batch queue; it only serves the
        // production model.
        Some(version) => {
            let state = state.clone();
            tokio::task::spawn_blocking(move || {
                state.service.predict(&image, Some(&version))
            })
            .await
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        }
        None => state.queue.predict(image).await,
    };

    prediction.map(Json).map_err(|e| error_response(&e))
}

/// One entry of a batch response: a prediction or a per-item error.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum BatchItem {
    Prediction(Prediction),
    Error { error: String },
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub results: Vec<BatchItem>,
    pub count: usize,
}

/// POST /predict_batch - Classify several images, uploaded as repeated
/// multipart fields "images"
pub async fn predict_batch(
    State(state): State<SharedState>,
    Query(query): Query<PredictQuery>,
    mut multipart: Multipart,
) -> Result<Json<BatchResponse>, (StatusCode, String)> {
    let mut images: Vec<Vec<u8>> = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid multipart body: {e}")))?
    {
        if field.name() == Some("images") {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| (StatusCode::BAD_REQUEST, format!("failed to read upload: {e}")))?;
            images.push(bytes.to_vec());
        }
    }
    if images.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "no \"images\" fields in request".to_string(),
        ));
    }

    let version = query.version;
    let state_clone = state.clone();
    let results = tokio::task::spawn_blocking(move || {
        state_clone
            .service
            .predict_batch(&images, version.as_deref())
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    .map_err(|e| error_response(&e))?;

    let results: Vec<BatchItem> = results
        .into_iter()
        .map(|item| match item {
            Ok(prediction) => BatchItem::Prediction(prediction),
            Err(err) => BatchItem::Error {
                error: err.to_string(),
            },
        })
        .collect();
    let count = results.len();

    Ok(Json(BatchResponse { results, count }))
}

/// GET /models - List all registered artifacts
pub async fn list_models(
    State(state): State<SharedState>,
) -> Result<Json<Vec<ArtifactMetadata>>, (StatusCode, String)> {
    state
        .service
        .list_models()
        .map(Json)
        .map_err(|e| error_response(&e))
}

#[derive(Debug, Deserialize)]
pub struct SetProductionRequest {
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct SetProductionResponse {
    pub production: String,
}

/// POST /admin/production - Point the production alias at a version
pub async fn set_production(
    State(state): State<SharedState>,
    Json(request): Json<SetProductionRequest>,
) -> Result<Json<SetProductionResponse>, (StatusCode, String)> {
    state
        .service
        .set_production(&request.version)
        .map_err(|e| error_response(&e))?;
    Ok(Json(SetProductionResponse {
        production: request.version,
    }))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub backend: String,
    pub uptime_seconds: u64,
    pub production_model: Option<String>,
    pub cache: Option<CacheStats>,
}

/// GET /health - Health check endpoint
pub async fn health_check(State(state): State<SharedState>) -> Json<HealthResponse> {
    let production_model = state.service.production_version().ok().flatten();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        backend: backend_name().to_string(),
        uptime_seconds: state.uptime_seconds(),
        production_model,
        cache: state.service.production_cache_stats(),
    })
}
