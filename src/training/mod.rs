//! Training pipeline orchestration.
//!
//! Drives the full flow described by a [`PipelineConfig`]: data
//! generation and assembly, one independent experiment per architecture,
//! evaluation on the held-out test partition, registration of every
//! successful model, and an optional ensemble over the survivors.

pub mod experiment;
pub mod trainer;

pub use experiment::{EpochMetrics, Experiment, ExperimentStatus};
pub use trainer::{Trainer, TrainingOutcome};

use burn::data::dataloader::batcher::Batcher;
use burn::module::Module;
use burn::record::CompactRecorder;
use burn::tensor::activation::softmax;
use tracing::{info, warn};

use crate::backend::{default_device, DefaultBackend, TrainingBackend};
use crate::config::{EnsembleConfig, PipelineConfig};
use crate::dataset::{
    assemble_dataset, generate_synthetic_dataset, load_real_dataset, DatasetSplit, Sample,
    SampleBatcher,
};
use crate::ensemble::{fit_meta_weights, CombinationRule, Ensemble};
use crate::error::{PavementError, Result};
use crate::evaluation::{evaluate_forward, evaluate_predictions, EvaluationReport};
use crate::model::{
    conv::{AttentionConvNet, ConvResidualNet, MobileLightNet},
    vit::VisionTransformerNet,
    ArchitectureSpec, Backbone, BackboneKind, LoadedBackbone,
};
use crate::registry::ModelRegistry;
use crate::dataset::ConditionClass;

/// Outcome of one pipeline run.
#[derive(Debug)]
pub struct PipelineReport {
    pub experiments: Vec<Experiment>,
    /// (architecture name, registry version, test report) per success
    pub registered: Vec<(String, String, EvaluationReport)>,
    pub ensemble_version: Option<String>,
}

impl PipelineReport {
    pub fn any_failed(&self) -> bool {
        self.experiments
            .iter()
            .any(|e| e.status == ExperimentStatus::Failed)
    }

    /// Registered single-model version with the highest test accuracy.
    /// Auto-deploy prefers `ensemble_version` over this when set.
    pub fn best_version(&self) -> Option<&str> {
        self.registered
            .iter()
            .max_by(|a, b| a.2.accuracy.total_cmp(&b.2.accuracy))
            .map(|(_, version, _)| version.as_str())
    }
}

/// Run the complete training pipeline.
pub fn run_pipeline(config: &PipelineConfig, auto_deploy: bool) -> Result<PipelineReport> {
    config.validate()?;

    let mut samples = generate_synthetic_dataset(&config.synthetic);
    if let Some(real_dir) = &config.real_data_dir {
        let first_id = samples.iter().map(|s| s.id).max().unwrap_or(0) + 1;
        samples.extend(load_real_dataset(real_dir, config.synthetic.image_size, first_id)?);
    }

    let split = assemble_dataset(samples, &config.assembly)?;
    let registry = ModelRegistry::open(&config.registry_dir)?;
    let staging = config.registry_dir.join("staging");
    std::fs::create_dir_all(&staging)?;

    let mut experiments = Vec::new();
    let mut registered = Vec::new();

    for spec in &config.architectures {
        info!("=== Experiment: {} ===", spec.name);
        let (experiment, artifact) = run_experiment(spec, config, &split, &registry, &staging)?;

        if let Some((version, report)) = artifact {
            info!("{} -> {} | {}", spec.name, version, report);
            registered.push((spec.name.clone(), version, report));
        }
        experiments.push(experiment);
    }

    let ensemble_version = match &config.ensemble {
        Some(ensemble_config) if registered.len() >= 2 => Some(build_ensemble(
            ensemble_config,
            &registered,
            &split,
            config.training.batch_size,
            &registry,
        )?),
        Some(_) => {
            warn!("Skipping ensemble: fewer than two successful experiments");
            None
        }
        None => None,
    };

    let report = PipelineReport {
        experiments,
        registered,
        ensemble_version,
    };

    if auto_deploy {
        let candidate = report
            .ensemble_version
            .as_deref()
            .or_else(|| report.best_version());
        if let Some(version) = candidate {
            registry.set_production(version)?;
        }
    }

    Ok(report)
}

/// Train and register a single architecture. Returns the experiment
/// record plus (version, test report) when the run produced a model.
fn run_experiment(
    spec: &ArchitectureSpec,
    config: &PipelineConfig,
    split: &DatasetSplit,
    registry: &ModelRegistry,
    staging: &std::path::Path,
) -> Result<(Experiment, Option<(String, EvaluationReport)>)> {
    spec.validate()?;
    match spec.backbone {
        BackboneKind::ConvResidual => {
            train_and_register::<ConvResidualNet<TrainingBackend>>(spec, config, split, registry, staging)
        }
        BackboneKind::AttentionConv => {
            train_and_register::<AttentionConvNet<TrainingBackend>>(spec, config, split, registry, staging)
        }
        BackboneKind::VisionTransformer => {
            train_and_register::<VisionTransformerNet<TrainingBackend>>(spec, config, split, registry, staging)
        }
        BackboneKind::MobileLight => {
            train_and_register::<MobileLightNet<TrainingBackend>>(spec, config, split, registry, staging)
        }
    }
}

fn train_and_register<M>(
    spec: &ArchitectureSpec,
    config: &PipelineConfig,
    split: &DatasetSplit,
    registry: &ModelRegistry,
    staging: &std::path::Path,
) -> Result<(Experiment, Option<(String, EvaluationReport)>)>
where
    M: Backbone<TrainingBackend> + burn::module::AutodiffModule<TrainingBackend>,
    M::InnerModule: Backbone<DefaultBackend>,
{
    let device = default_device();
    let experiment = Experiment::new(spec.clone(), config.training.clone());
    let trainer = Trainer::<TrainingBackend, M>::new(spec, config.training.clone(), device.clone());

    let outcome = trainer.train(split, experiment);
    let mut experiment = outcome.experiment;

    let Some(model) = outcome.model else {
        // Failed runs keep their record but register nothing
        experiment.save(&staging.join(format!("{}-failed.json", spec.name)))?;
        return Ok((experiment, None));
    };

    let report = evaluate_forward::<DefaultBackend, _>(
        |images| model.forward(images).condition,
        &split.test,
        config.training.batch_size,
        &device,
    );

    let staged = staging.join(format!("{}-weights", spec.name));
    model
        .clone()
        .save_file(&staged, &CompactRecorder::new())
        .map_err(|e| PavementError::Export(e.to_string()))?;

    let version = registry.register_model(
        spec,
        &staged.with_extension("mpk"),
        &report,
        Some(experiment.id),
    )?;
    experiment.save(&registry.root().join(&version).join("experiment.json"))?;

    Ok((experiment, Some((version, report))))
}

/// Per-sample softmax probabilities for a loaded model.
fn model_probabilities(
    model: &LoadedBackbone<DefaultBackend>,
    samples: &[Sample],
    batch_size: usize,
) -> Vec<Vec<f32>> {
    let device = default_device();
    let mut all = Vec::with_capacity(samples.len());
    if samples.is_empty() {
        return all;
    }
    let batcher = SampleBatcher::<DefaultBackend>::new(device, samples[0].size);

    for chunk in samples.chunks(batch_size.max(1)) {
        let batch = batcher.batch(chunk.to_vec());
        let probs = softmax(model.forward(batch.images).condition, 1);
        let [rows, cols] = probs.dims();
        let flat: Vec<f32> = probs
            .into_data()
            .to_vec()
            .expect("softmax output is contiguous float data");
        for row in 0..rows {
            all.push(flat[row * cols..(row + 1) * cols].to_vec());
        }
    }
    all
}

/// Build, evaluate and register an ensemble over the trained models.
fn build_ensemble(
    config: &EnsembleConfig,
    registered: &[(String, String, EvaluationReport)],
    split: &DatasetSplit,
    batch_size: usize,
    registry: &ModelRegistry,
) -> Result<String> {
    let device = default_device();
    let members: Vec<String> = registered.iter().map(|(_, v, _)| v.clone()).collect();

    let mut models = Vec::with_capacity(members.len());
    for version in &members {
        let entry = registry.get(version)?;
        let spec = entry
            .spec
            .ok_or_else(|| PavementError::Config(format!("{} is not a model version", version)))?;
        let weights = entry
            .weights
            .ok_or_else(|| PavementError::Config(format!("{} has no weights", version)))?;
        models.push(LoadedBackbone::<DefaultBackend>::load(&spec, &weights, &device)?);
    }

    let ensemble = match config.rule {
        CombinationRule::Average => Ensemble::average(members),
        CombinationRule::LearnedMeta => {
            let member_probs: Vec<Vec<Vec<f32>>> = models
                .iter()
                .map(|m| model_probabilities(m, &split.validation, batch_size))
                .collect();
            let truths: Vec<ConditionClass> =
                split.validation.iter().map(|s| s.condition).collect();
            let weights = fit_meta_weights(&member_probs, &truths, config.min_validation)?;
            Ensemble::learned(members, weights)?
        }
    };

    // Evaluate the composite on the test partition
    let test_probs: Vec<Vec<Vec<f32>>> = models
        .iter()
        .map(|m| model_probabilities(m, &split.test, batch_size))
        .collect();
    let mut predictions = Vec::with_capacity(split.test.len());
    for sample_idx in 0..split.test.len() {
        let per_member: Vec<Vec<f32>> = test_probs
            .iter()
            .map(|m| m[sample_idx].clone())
            .collect();
        let combined = ensemble.combine(&per_member)?;
        let best = combined
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::MIN), |acc, (i, v)| if v > acc.1 { (i, v) } else { acc })
            .0;
        predictions.push(ConditionClass::from_index(best).unwrap_or(ConditionClass::Failed));
    }
    let truths: Vec<ConditionClass> = split.test.iter().map(|s| s.condition).collect();
    let report = evaluate_predictions(&truths, &predictions);
    info!("Ensemble ({:?}) | {}", ensemble.rule, report);

    registry.register_ensemble(&ensemble, &report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnsembleConfig, PipelineConfig, TrainingConfig};
    use crate::dataset::{AssemblyConfig, SyntheticConfig};

    fn small_pipeline(dir: &std::path::Path) -> PipelineConfig {
        PipelineConfig {
            synthetic: SyntheticConfig {
                samples_per_class: 12,
                image_size: 16,
                seed: 9,
            },
            real_data_dir: None,
            assembly: AssemblyConfig::default(),
            architectures: vec![ArchitectureSpec::mobile_light(16)],
            training: TrainingConfig {
                epochs: 2,
                batch_size: 16,
                ..TrainingConfig::default()
            },
            registry_dir: dir.join("registry"),
            ensemble: None,
            serving: Default::default(),
        }
    }

    #[test]
    fn test_pipeline_registers_model() {
        let dir = tempfile::tempdir().unwrap();
        let report = run_pipeline(&small_pipeline(dir.path()), false).unwrap();

        assert!(!report.any_failed());
        assert_eq!(report.registered.len(), 1);
        assert_eq!(report.registered[0].1, "v0001");
        assert!(report.ensemble_version.is_none());

        let registry = ModelRegistry::open(dir.path().join("registry")).unwrap();
        let entry = registry.get("v0001").unwrap();
        assert!(entry.weights.is_some());
        assert!(registry
            .root()
            .join("v0001")
            .join("experiment.json")
            .exists());
    }

    #[test]
    fn test_pipeline_auto_deploy_sets_production() {
        let dir = tempfile::tempdir().unwrap();
        run_pipeline(&small_pipeline(dir.path()), true).unwrap();

        let registry = ModelRegistry::open(dir.path().join("registry")).unwrap();
        assert_eq!(registry.production().unwrap(), Some("v0001".to_string()));
    }

    #[test]
    fn test_pipeline_with_average_ensemble() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = small_pipeline(dir.path());
        config.architectures = vec![
            ArchitectureSpec::mobile_light(16),
            {
                let mut spec = ArchitectureSpec::conv_residual(16);
                spec.depth = 2;
                spec.base_filters = 8;
                spec
            },
        ];
        config.ensemble = Some(EnsembleConfig::default());

        let report = run_pipeline(&config, false).unwrap();
        assert_eq!(report.registered.len(), 2);
        assert!(report.ensemble_version.is_some());
    }
}
