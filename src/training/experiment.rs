//! Experiment records.
//!
//! Every architecture trained by the pipeline gets its own experiment:
//! an append-only record of per-epoch metrics plus a terminal status.
//! Records are persisted as JSON next to the model artifacts.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::TrainingConfig;
use crate::error::Result;
use crate::model::ArchitectureSpec;

/// Lifecycle of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Initialized,
    Training,
    /// Ran all configured epochs
    Completed,
    /// Early stopping triggered
    StoppedEarly,
    /// Unrecoverable failure (e.g. NaN loss); artifacts discarded
    Failed,
}

impl ExperimentStatus {
    /// Terminal states that still produce a usable model.
    pub fn is_success(self) -> bool {
        matches!(self, ExperimentStatus::Completed | ExperimentStatus::StoppedEarly)
    }
}

/// Metrics for one training epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub learning_rate: f64,
    pub duration_secs: f64,
}

/// Full record of a single training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: Uuid,
    pub spec: ArchitectureSpec,
    pub training: TrainingConfig,
    pub status: ExperimentStatus,
    pub epochs: Vec<EpochMetrics>,
    /// Epoch index whose weights were exported
    pub best_epoch: Option<usize>,
    pub best_val_loss: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure description when status is `Failed`
    pub failure: Option<String>,
}

impl Experiment {
    pub fn new(spec: ArchitectureSpec, training: TrainingConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            spec,
            training,
            status: ExperimentStatus::Initialized,
            epochs: Vec::new(),
            best_epoch: None,
            best_val_loss: None,
            started_at: None,
            finished_at: None,
            failure: None,
        }
    }

    pub fn start(&mut self) {
        self.status = ExperimentStatus::Training;
        self.started_at = Some(Utc::now());
    }

    pub fn record_epoch(&mut self, metrics: EpochMetrics) {
        self.epochs.push(metrics);
    }

    pub fn mark_best(&mut self, epoch: usize, val_loss: f64) {
        self.best_epoch = Some(epoch);
        self.best_val_loss = Some(val_loss);
    }

    pub fn finish(&mut self, status: ExperimentStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = ExperimentStatus::Failed;
        self.failure = Some(reason.into());
        self.finished_at = Some(Utc::now());
    }

    /// Final validation accuracy at the best epoch, if any.
    pub fn best_val_accuracy(&self) -> Option<f64> {
        self.best_epoch
            .and_then(|e| self.epochs.iter().find(|m| m.epoch == e))
            .map(|m| m.val_accuracy)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_experiment() -> Experiment {
        Experiment::new(
            ArchitectureSpec::mobile_light(32),
            TrainingConfig::default(),
        )
    }

    #[test]
    fn test_lifecycle() {
        let mut exp = dummy_experiment();
        assert_eq!(exp.status, ExperimentStatus::Initialized);

        exp.start();
        assert_eq!(exp.status, ExperimentStatus::Training);
        assert!(exp.started_at.is_some());

        exp.record_epoch(EpochMetrics {
            epoch: 0,
            train_loss: 1.5,
            train_accuracy: 0.3,
            val_loss: 1.4,
            val_accuracy: 0.35,
            learning_rate: 1e-3,
            duration_secs: 2.0,
        });
        exp.mark_best(0, 1.4);
        exp.finish(ExperimentStatus::Completed);

        assert!(exp.status.is_success());
        assert_eq!(exp.best_val_accuracy(), Some(0.35));
    }

    #[test]
    fn test_failure_is_terminal_and_not_success() {
        let mut exp = dummy_experiment();
        exp.start();
        exp.fail("loss became NaN at epoch 3");

        assert_eq!(exp.status, ExperimentStatus::Failed);
        assert!(!exp.status.is_success());
        assert!(exp.failure.as_deref().unwrap().contains("NaN"));
    }

    #[test]
    fn test_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiment.json");

        let mut exp = dummy_experiment();
        exp.start();
        exp.finish(ExperimentStatus::StoppedEarly);
        exp.save(&path).unwrap();

        let loaded = Experiment::load(&path).unwrap();
        assert_eq!(loaded.id, exp.id);
        assert_eq!(loaded.status, ExperimentStatus::StoppedEarly);
    }
}
