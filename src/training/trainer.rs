//! Training loop.
//!
//! One trainer per experiment: Adam with weight decay and optional
//! gradient clipping, a cosine or constant learning-rate schedule,
//! validation after every epoch, early stopping on validation loss, and
//! best-epoch weight retention. A NaN loss terminates the run as
//! `Failed` and discards all partial state.

use std::time::Instant;

use burn::{
    module::AutodiffModule,
    nn::loss::CrossEntropyLossConfig,
    optim::{decay::WeightDecayConfig, AdamConfig, GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};

use crate::config::{LrSchedule, TrainingConfig};
use crate::dataset::{make_batches, DatasetSplit, Sample, SampleBatch, SampleBatcher};
use crate::model::{ArchitectureSpec, Backbone};
use crate::training::experiment::{EpochMetrics, Experiment, ExperimentStatus};

/// Result of a training run. `model` holds the best-validation weights
/// on the inner (inference) backend and is `None` exactly when the
/// experiment failed.
pub struct TrainingOutcome<M> {
    pub experiment: Experiment,
    pub model: Option<M>,
}

/// Trainer generic over the backbone family.
pub struct Trainer<B, M>
where
    B: AutodiffBackend,
    M: Backbone<B> + AutodiffModule<B>,
    M::InnerModule: Backbone<B::InnerBackend>,
{
    model: M,
    optimizer: burn::optim::adaptor::OptimizerAdaptor<burn::optim::Adam<B::InnerBackend>, M, B>,
    config: TrainingConfig,
    crack_loss_weight: Option<f64>,
    device: B::Device,
    current_lr: f64,
}

impl<B, M> Trainer<B, M>
where
    B: AutodiffBackend,
    M: Backbone<B> + AutodiffModule<B>,
    M::InnerModule: Backbone<B::InnerBackend>,
{
    pub fn new(spec: &ArchitectureSpec, config: TrainingConfig, device: B::Device) -> Self {
        let model = M::build(spec, &device);

        let mut adam = AdamConfig::new()
            .with_weight_decay(Some(WeightDecayConfig::new(config.weight_decay)));
        if let Some(threshold) = config.grad_clip {
            adam = adam.with_grad_clipping(Some(
                burn::grad_clipping::GradientClippingConfig::Norm(threshold),
            ));
        }
        let optimizer = adam.init();

        let crack_loss_weight = spec
            .heads
            .crack_head
            .then_some(spec.heads.crack_loss_weight);

        let current_lr = config.learning_rate;
        Self {
            model,
            optimizer,
            config,
            crack_loss_weight,
            device,
            current_lr,
        }
    }

    /// Run the full training loop over the split.
    pub fn train(mut self, split: &DatasetSplit, mut experiment: Experiment) -> TrainingOutcome<M::InnerModule> {
        B::seed(self.config.seed);
        experiment.start();

        if self.config.mixed_precision {
            info!("mixed_precision requested; ignored on the CPU backend");
        }

        let image_size = experiment.spec.image_size;
        let train_batcher = SampleBatcher::<B>::new(self.device.clone(), image_size);
        let valid_batcher = SampleBatcher::<B::InnerBackend>::new(self.device.clone(), image_size);

        let val_batches = make_batches(&split.validation, self.config.batch_size, &valid_batcher);

        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        let mut train_samples: Vec<Sample> = split.train.to_vec();

        let mut best_model: Option<M::InnerModule> = None;
        let mut best_val_loss = f64::INFINITY;
        let mut epochs_without_improvement = 0usize;
        let mut stopped_early = false;

        info!(
            "Training '{}' ({}): {} train / {} val samples, {} epochs max",
            experiment.spec.name,
            experiment.spec.backbone,
            split.train.len(),
            split.validation.len(),
            self.config.epochs
        );

        for epoch in 0..self.config.epochs {
            let epoch_start = Instant::now();
            self.current_lr = self.scheduled_lr(epoch);

            train_samples.shuffle(&mut rng);
            let batches = make_batches(&train_samples, self.config.batch_size, &train_batcher);

            let (train_loss, train_accuracy) = match self.train_epoch(&batches, epoch) {
                Ok(metrics) => metrics,
                Err(reason) => {
                    warn!("Experiment '{}' failed: {}", experiment.spec.name, reason);
                    experiment.fail(reason);
                    return TrainingOutcome {
                        experiment,
                        model: None,
                    };
                }
            };

            let (val_loss, val_accuracy) = self.evaluate(&val_batches);
            if val_loss.is_nan() {
                let reason = format!("validation loss became NaN at epoch {}", epoch);
                warn!("Experiment '{}' failed: {}", experiment.spec.name, reason);
                experiment.fail(reason);
                return TrainingOutcome {
                    experiment,
                    model: None,
                };
            }

            experiment.record_epoch(EpochMetrics {
                epoch,
                train_loss,
                train_accuracy,
                val_loss,
                val_accuracy,
                learning_rate: self.current_lr,
                duration_secs: epoch_start.elapsed().as_secs_f64(),
            });

            info!(
                "Epoch {}/{}: train loss {:.4} acc {:.2}% | val loss {:.4} acc {:.2}% | lr {:.6}",
                epoch + 1,
                self.config.epochs,
                train_loss,
                train_accuracy * 100.0,
                val_loss,
                val_accuracy * 100.0,
                self.current_lr
            );

            if val_loss < best_val_loss - 1e-6 {
                best_val_loss = val_loss;
                best_model = Some(self.model.valid());
                epochs_without_improvement = 0;
                experiment.mark_best(epoch, val_loss);
                debug!("New best model at epoch {} (val loss {:.4})", epoch, val_loss);
            } else {
                epochs_without_improvement += 1;
                if epochs_without_improvement >= self.config.patience {
                    info!(
                        "Early stopping after {} epochs without improvement",
                        self.config.patience
                    );
                    stopped_early = true;
                    break;
                }
            }
        }

        experiment.finish(if stopped_early {
            ExperimentStatus::StoppedEarly
        } else {
            ExperimentStatus::Completed
        });

        TrainingOutcome {
            experiment,
            model: best_model,
        }
    }

    /// One optimization pass over the shuffled batches. Returns
    /// (average loss, accuracy) or the failure reason on NaN.
    fn train_epoch(
        &mut self,
        batches: &[SampleBatch<B>],
        epoch: usize,
    ) -> std::result::Result<(f64, f64), String> {
        let mut total_loss = 0.0;
        let mut correct = 0usize;
        let mut total = 0usize;

        for (batch_idx, batch) in batches.iter().enumerate() {
            let output = self.model.forward(batch.images.clone());

            let mut loss = CrossEntropyLossConfig::new()
                .init(&output.condition.device())
                .forward(output.condition.clone(), batch.conditions.clone());

            if let (Some(weight), Some(crack_logits), Some(crack_targets)) =
                (self.crack_loss_weight, &output.crack, &batch.cracks)
            {
                let crack_loss = CrossEntropyLossConfig::new()
                    .init(&crack_logits.device())
                    .forward(crack_logits.clone(), crack_targets.clone());
                loss = loss + crack_loss.mul_scalar(weight);
            }

            let loss_value: f64 = loss.clone().into_scalar().elem();
            if loss_value.is_nan() {
                return Err(format!(
                    "training loss became NaN at epoch {} batch {}",
                    epoch, batch_idx
                ));
            }
            total_loss += loss_value;

            let (batch_correct, batch_total) =
                count_correct(&output.condition, &batch.conditions);
            correct += batch_correct;
            total += batch_total;

            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &self.model);
            self.model = self.optimizer.step(self.current_lr, self.model.clone(), grads);
        }

        let avg_loss = if batches.is_empty() {
            0.0
        } else {
            total_loss / batches.len() as f64
        };
        let accuracy = if total > 0 {
            correct as f64 / total as f64
        } else {
            0.0
        };
        Ok((avg_loss, accuracy))
    }

    /// Validation pass on the inner backend (no autodiff, dropout off).
    fn evaluate(&self, batches: &[SampleBatch<B::InnerBackend>]) -> (f64, f64) {
        let model = self.model.valid();
        let mut total_loss = 0.0;
        let mut correct = 0usize;
        let mut total = 0usize;

        for batch in batches {
            let output = model.forward(batch.images.clone());
            let loss = CrossEntropyLossConfig::new()
                .init(&output.condition.device())
                .forward(output.condition.clone(), batch.conditions.clone());
            let loss_value: f64 = loss.into_scalar().elem();
            total_loss += loss_value;

            let (batch_correct, batch_total) =
                count_correct(&output.condition, &batch.conditions);
            correct += batch_correct;
            total += batch_total;
        }

        let avg_loss = if batches.is_empty() {
            0.0
        } else {
            total_loss / batches.len() as f64
        };
        let accuracy = if total > 0 {
            correct as f64 / total as f64
        } else {
            0.0
        };
        (avg_loss, accuracy)
    }

    fn scheduled_lr(&self, epoch: usize) -> f64 {
        match self.config.lr_schedule {
            LrSchedule::Constant => self.config.learning_rate,
            LrSchedule::Cosine => {
                let progress = epoch as f64 / self.config.epochs.max(1) as f64;
                self.config.learning_rate * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos())
            }
        }
    }
}

/// Count correct argmax predictions in a batch.
fn count_correct<Bx: Backend>(
    logits: &Tensor<Bx, 2>,
    targets: &Tensor<Bx, 1, Int>,
) -> (usize, usize) {
    let predictions = logits.clone().argmax(1).squeeze::<1>(1);
    let correct: i64 = predictions
        .equal(targets.clone())
        .int()
        .sum()
        .into_scalar()
        .elem();
    (correct as usize, targets.dims()[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{default_device, TrainingBackend};
    use crate::config::TrainingConfig;
    use crate::dataset::{assemble_dataset, generate_synthetic_dataset, AssemblyConfig, SyntheticConfig};
    use crate::model::conv::MobileLightNet;

    fn tiny_split() -> DatasetSplit {
        let samples = generate_synthetic_dataset(&SyntheticConfig {
            samples_per_class: 10,
            image_size: 16,
            seed: 5,
        });
        assemble_dataset(
            samples,
            &AssemblyConfig {
                min_per_class: 3,
                ..AssemblyConfig::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_short_training_run_completes() {
        let device = default_device();
        let spec = ArchitectureSpec::mobile_light(16);
        let config = TrainingConfig {
            epochs: 2,
            batch_size: 16,
            patience: 5,
            ..TrainingConfig::default()
        };

        let experiment = Experiment::new(spec.clone(), config.clone());
        let trainer = Trainer::<TrainingBackend, MobileLightNet<TrainingBackend>>::new(
            &spec, config, device,
        );
        let outcome = trainer.train(&tiny_split(), experiment);

        assert!(outcome.experiment.status.is_success());
        assert!(outcome.model.is_some());
        assert_eq!(outcome.experiment.epochs.len(), 2);
        assert!(outcome.experiment.best_epoch.is_some());
    }

    #[test]
    fn test_cosine_schedule_decays() {
        let device = default_device();
        let spec = ArchitectureSpec::mobile_light(16);
        let config = TrainingConfig {
            epochs: 10,
            lr_schedule: LrSchedule::Cosine,
            ..TrainingConfig::default()
        };
        let trainer = Trainer::<TrainingBackend, MobileLightNet<TrainingBackend>>::new(
            &spec, config, device,
        );

        let start = trainer.scheduled_lr(0);
        let late = trainer.scheduled_lr(9);
        assert!(start > late);
        assert!((start - 1e-3).abs() < 1e-9);
    }
}
