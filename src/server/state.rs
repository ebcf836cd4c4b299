//! Shared application state for the inference server.

use std::sync::Arc;
use std::time::Instant;

use crate::inference::{BatchQueue, InferenceService};

/// Shared application state.
pub struct AppState {
    /// Serving facade over the model registry
    pub service: Arc<InferenceService>,
    /// Micro-batching queue for single-image requests
    pub queue: BatchQueue,
    /// Server start time
    pub started_at: Instant,
}

impl AppState {
    pub fn new(service: Arc<InferenceService>) -> Self {
        let queue = BatchQueue::start(Arc::clone(&service));
        Self {
            service,
            queue,
            started_at: Instant::now(),
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

pub type SharedState = Arc<AppState>;
