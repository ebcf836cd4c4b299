//! Pipeline configuration.
//!
//! A single JSON file drives the whole training pipeline: data sources,
//! split policy, architectures to train, hyperparameters, registry
//! location and serving knobs. `PipelineConfig::load` plus `validate`
//! is the only entry point the CLI uses.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::dataset::{AssemblyConfig, SyntheticConfig};
use crate::ensemble::CombinationRule;
use crate::error::{PavementError, Result};
use crate::model::ArchitectureSpec;
use crate::{DEFAULT_IMAGE_SIZE, LOW_CONFIDENCE_THRESHOLD};

/// Learning-rate schedule over the training run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedule {
    /// Fixed learning rate
    Constant,
    /// Cosine annealing from the initial rate to near zero
    Cosine,
}

/// Hyperparameters for one training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Maximum number of epochs
    pub epochs: usize,
    /// Mini-batch size
    pub batch_size: usize,
    /// Initial learning rate
    pub learning_rate: f64,
    /// Adam weight decay
    pub weight_decay: f64,
    /// Epochs without validation-loss improvement before stopping
    pub patience: usize,
    /// Learning-rate schedule
    pub lr_schedule: LrSchedule,
    /// Gradient norm clipping threshold, if any
    pub grad_clip: Option<f32>,
    /// Mixed-precision request; a no-op on the CPU backend
    pub mixed_precision: bool,
    /// Seed for shuffling and weight init
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 30,
            batch_size: 32,
            learning_rate: 1e-3,
            weight_decay: 1e-4,
            patience: 5,
            lr_schedule: LrSchedule::Cosine,
            grad_clip: Some(1.0),
            mixed_precision: false,
            seed: 42,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(PavementError::Config("epochs must be positive".to_string()));
        }
        if self.batch_size == 0 {
            return Err(PavementError::Config("batch_size must be positive".to_string()));
        }
        if self.learning_rate <= 0.0 || self.learning_rate >= 1.0 {
            return Err(PavementError::Config(format!(
                "learning_rate must be in (0, 1), got {}",
                self.learning_rate
            )));
        }
        if self.weight_decay < 0.0 {
            return Err(PavementError::Config("weight_decay must not be negative".to_string()));
        }
        if self.patience == 0 {
            return Err(PavementError::Config("patience must be positive".to_string()));
        }
        Ok(())
    }
}

/// Ensemble construction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleConfig {
    /// How member probabilities are combined
    pub rule: CombinationRule,
    /// Minimum validation samples required to fit learned weights
    pub min_validation: usize,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            rule: CombinationRule::Average,
            min_validation: 20,
        }
    }
}

/// Inference service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServingConfig {
    /// Bind address
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Prediction cache time-to-live in seconds
    pub cache_ttl_seconds: u64,
    /// Maximum cached predictions before eviction
    pub cache_capacity: usize,
    /// Largest micro-batch assembled by the batch queue
    pub max_batch_size: usize,
    /// How long the queue waits to fill a batch, in milliseconds
    pub batch_window_ms: u64,
    /// Predictions below this confidence are flagged for review
    pub confidence_threshold: f32,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cache_ttl_seconds: 3600,
            cache_capacity: 10_000,
            max_batch_size: 8,
            batch_window_ms: 25,
            confidence_threshold: LOW_CONFIDENCE_THRESHOLD,
        }
    }
}

impl ServingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(PavementError::Config("max_batch_size must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(PavementError::Config(format!(
                "confidence_threshold must be in [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        Ok(())
    }
}

/// Top-level configuration for the whole pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Synthetic data generation
    pub synthetic: SyntheticConfig,
    /// Optional directory of real labeled images (`<dir>/<class>/*.png`)
    pub real_data_dir: Option<PathBuf>,
    /// Split policy
    pub assembly: AssemblyConfig,
    /// Architectures to train, one experiment each
    pub architectures: Vec<ArchitectureSpec>,
    /// Shared training hyperparameters
    pub training: TrainingConfig,
    /// Model registry location
    pub registry_dir: PathBuf,
    /// Optional ensemble built from the trained models
    pub ensemble: Option<EnsembleConfig>,
    /// Serving settings
    pub serving: ServingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            synthetic: SyntheticConfig::default(),
            real_data_dir: None,
            assembly: AssemblyConfig::default(),
            architectures: vec![
                ArchitectureSpec::conv_residual(DEFAULT_IMAGE_SIZE),
                ArchitectureSpec::mobile_light(DEFAULT_IMAGE_SIZE),
            ],
            training: TrainingConfig::default(),
            registry_dir: PathBuf::from("registry"),
            ensemble: None,
            serving: ServingConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.architectures.is_empty() {
            return Err(PavementError::Config(
                "at least one architecture must be specified".to_string(),
            ));
        }
        for spec in &self.architectures {
            spec.validate()?;
            if spec.image_size != self.synthetic.image_size {
                return Err(PavementError::Config(format!(
                    "architecture '{}' expects {}px input but synthetic data is {}px",
                    spec.name, spec.image_size, self.synthetic.image_size
                )));
            }
        }

        let mut names: Vec<&str> = self.architectures.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.architectures.len() {
            return Err(PavementError::Config(
                "architecture names must be unique".to_string(),
            ));
        }

        self.assembly.validate()?;
        self.training.validate()?;
        self.serving.validate()?;

        if let Some(ensemble) = &self.ensemble {
            if self.architectures.len() < 2 {
                return Err(PavementError::Config(
                    "an ensemble needs at least two architectures".to_string(),
                ));
            }
            if ensemble.min_validation == 0 {
                return Err(PavementError::Config(
                    "ensemble min_validation must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");

        let mut config = PipelineConfig::default();
        config.training.epochs = 7;
        config.save(&path).unwrap();

        let loaded = PipelineConfig::load(&path).unwrap();
        assert_eq!(loaded.training.epochs, 7);
        assert_eq!(loaded.architectures.len(), 2);
    }

    #[test]
    fn test_mismatched_image_size_rejected() {
        let mut config = PipelineConfig::default();
        config.synthetic.image_size = 32;
        assert!(matches!(
            config.validate().unwrap_err(),
            PavementError::Config(_)
        ));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut config = PipelineConfig::default();
        config.architectures = vec![
            ArchitectureSpec::conv_residual(DEFAULT_IMAGE_SIZE),
            ArchitectureSpec::conv_residual(DEFAULT_IMAGE_SIZE),
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ensemble_needs_two_members() {
        let mut config = PipelineConfig::default();
        config.architectures = vec![ArchitectureSpec::conv_residual(DEFAULT_IMAGE_SIZE)];
        config.ensemble = Some(EnsembleConfig::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_training_config() {
        let mut config = TrainingConfig::default();
        config.learning_rate = 0.0;
        assert!(config.validate().is_err());
    }
}
