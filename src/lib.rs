//! PaveMaster AI — pavement condition classification.
//!
//! This crate covers the full lifecycle of a pavement-condition model:
//! synthetic data generation, dataset assembly with stratified splits,
//! training of multiple backbone architectures, ensembling, evaluation
//! with road-maintenance-specific metrics, a versioned model registry,
//! and an HTTP inference service with caching and micro-batching.

pub mod backend;
pub mod config;
pub mod dataset;
pub mod ensemble;
pub mod error;
pub mod evaluation;
pub mod inference;
pub mod logging;
pub mod model;
pub mod registry;
pub mod server;
pub mod training;

pub use error::{PavementError, Result};

/// Number of pavement condition classes (excellent..failed).
pub const NUM_CONDITION_CLASSES: usize = 5;

/// Number of crack type classes for the auxiliary head.
pub const NUM_CRACK_CLASSES: usize = 6;

/// Default square input size for the backbones.
pub const DEFAULT_IMAGE_SIZE: usize = 64;

/// Number of input channels (RGB).
pub const IMAGE_CHANNELS: usize = 3;

/// Confidence below which predictions are flagged for manual inspection.
pub const LOW_CONFIDENCE_THRESHOLD: f32 = 0.7;
