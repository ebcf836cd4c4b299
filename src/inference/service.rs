//! Serving facade: registry-backed model table and micro-batching.
//!
//! [`InferenceService`] keeps loaded predictors in memory keyed by
//! registry version, resolves the production pointer, and routes
//! requests. [`BatchQueue`] sits in front of it for the HTTP predict
//! path, coalescing concurrent single-image requests into one forward
//! pass per window.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::config::ServingConfig;
use crate::error::{PavementError, Result};
use crate::registry::{ArtifactMetadata, ModelRegistry};

use super::cache::{CachedPredictor, CacheStats};
use super::predictor::{Prediction, Predictor};

/// Registry-backed model serving table.
pub struct InferenceService {
    registry: ModelRegistry,
    config: ServingConfig,
    loaded: DashMap<String, Arc<CachedPredictor>>,
}

impl InferenceService {
    pub fn new(registry: ModelRegistry, config: ServingConfig) -> Self {
        Self {
            registry,
            config,
            loaded: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ServingConfig {
        &self.config
    }

    /// The current production version, if one is set.
    pub fn production_version(&self) -> Result<Option<String>> {
        self.registry.production()
    }

    /// All registered artifacts, oldest first.
    pub fn list_models(&self) -> Result<Vec<ArtifactMetadata>> {
        self.registry.list()
    }

    /// Point production at an existing version. Requests already
    /// holding the old predictor finish against it.
    pub fn set_production(&self, version: &str) -> Result<()> {
        self.registry.set_production(version)?;
        info!(version, "production pointer updated");
        Ok(())
    }

    /// Resolve a version (or the production pointer when `None`) to a
    /// loaded predictor, loading weights on first use.
    pub fn predictor(&self, version: Option<&str>) -> Result<Arc<CachedPredictor>> {
        let version = match version {
            Some(v) => v.to_string(),
            None => self.production_version()?.ok_or_else(|| {
                PavementError::NotFound("no production model is set".to_string())
            })?,
        };

        if let Some(existing) = self.loaded.get(&version) {
            return Ok(Arc::clone(&existing));
        }

        let predictor = Predictor::from_registry(
            &self.registry,
            &version,
            self.config.confidence_threshold,
        )?
        .with_max_batch(self.config.max_batch_size);
        info!(version, "loaded model into serving table");
        let cached = Arc::new(CachedPredictor::new(
            predictor,
            Duration::from_secs(self.config.cache_ttl_seconds),
            self.config.cache_capacity,
        ));
        self.loaded.insert(version, Arc::clone(&cached));
        Ok(cached)
    }

    pub fn predict(&self, image_bytes: &[u8], version: Option<&str>) -> Result<Prediction> {
        self.predictor(version)?.predict(image_bytes)
    }

    pub fn predict_batch(
        &self,
        images: &[Vec<u8>],
        version: Option<&str>,
    ) -> Result<Vec<Result<Prediction>>> {
        Ok(self.predictor(version)?.predict_batch(images))
    }

    /// Cache statistics for the production predictor, if it is loaded.
    pub fn production_cache_stats(&self) -> Option<CacheStats> {
        let version = self.production_version().ok().flatten()?;
        self.loaded.get(&version).map(|p| p.cache_stats())
    }
}

fn internal_error(message: impl Into<String>) -> PavementError {
    PavementError::Io(std::io::Error::other(message.into()))
}

struct QueuedRequest {
    image_bytes: Vec<u8>,
    reply: oneshot::Sender<Result<Prediction>>,
}

/// Micro-batching front for single-image requests.
///
/// A worker drains the channel into batches of up to `max_batch_size`
/// images, waiting at most `batch_window_ms` for stragglers, then runs
/// one blocking forward pass for the whole batch.
pub struct BatchQueue {
    sender: mpsc::Sender<QueuedRequest>,
}

impl BatchQueue {
    pub fn start(service: Arc<InferenceService>) -> Self {
        let (sender, receiver) = mpsc::channel(1024);
        let max_batch = service.config().max_batch_size.max(1);
        let window = Duration::from_millis(service.config().batch_window_ms);
        tokio::spawn(batch_worker(service, receiver, max_batch, window));
        Self { sender }
    }

    /// Submit one image and wait for its prediction.
    pub async fn predict(&self, image_bytes: Vec<u8>) -> Result<Prediction> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(QueuedRequest { image_bytes, reply })
            .await
            .map_err(|_| internal_error("batch queue is stopped"))?;
        response
            .await
            .map_err(|_| internal_error("batch worker dropped the request"))?
    }
}

async fn batch_worker(
    service: Arc<InferenceService>,
    mut receiver: mpsc::Receiver<QueuedRequest>,
    max_batch: usize,
    window: Duration,
) {
    while let Some(first) = receiver.recv().await {
        let mut batch = vec![first];
        let deadline = tokio::time::Instant::now() + window;
        while batch.len() < max_batch {
            match tokio::time::timeout_at(deadline, receiver.recv()).await {
                Ok(Some(request)) => batch.push(request),
                Ok(None) | Err(_) => break,
            }
        }

        let images: Vec<Vec<u8>> = batch.iter().map(|r| r.image_bytes.clone()).collect();
        let service = Arc::clone(&service);
        let results = tokio::task::spawn_blocking(move || {
            service.predict_batch(&images, None)
        })
        .await;

        match results {
            Ok(Ok(results)) => {
                for (request, result) in batch.into_iter().zip(results) {
                    let _ = request.reply.send(result);
                }
            }
            Ok(Err(err)) => {
                warn!(error = %err, "batch inference failed");
                // Keep the NotFound variant so the HTTP layer can still
                // answer 404 when no production model is set.
                let message = err.to_string();
                let not_found = matches!(err, PavementError::NotFound(_));
                for request in batch {
                    let error = if not_found {
                        PavementError::NotFound(message.clone())
                    } else {
                        internal_error(message.clone())
                    };
                    let _ = request.reply.send(Err(error));
                }
            }
            Err(join_err) => {
                warn!(error = %join_err, "batch worker task panicked");
                for request in batch {
                    let _ = request.reply.send(Err(internal_error("inference task failed")));
                }
            }
        }
    }
}
