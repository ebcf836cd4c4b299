//! Inference: pure prediction, caching, and the serving facade.

pub mod cache;
pub mod predictor;
pub mod service;

pub use cache::{CachedPredictor, CacheStats, PredictionCache};
pub use predictor::{Prediction, Predictor};
pub use service::{BatchQueue, InferenceService};
