//! Pure inference over a single loaded model or an ensemble.
//!
//! A [`Predictor`] owns its weights and has no knowledge of caching or
//! HTTP; the cache wraps it as a decorator and the service composes
//! both. Prediction is deterministic: the same bytes always produce the
//! same result.

use std::collections::BTreeMap;
use std::time::Instant;

use burn::data::dataloader::batcher::Batcher;
use burn::tensor::activation::softmax;
use serde::{Deserialize, Serialize};

use crate::backend::{default_device, DefaultBackend};
use crate::dataset::{
    preprocess, ConditionClass, MaintenanceUrgency, Provenance, Sample, SampleBatcher,
};
use crate::ensemble::Ensemble;
use crate::error::{PavementError, Result};
use crate::model::LoadedBackbone;
use crate::registry::{ArtifactKind, ModelRegistry};

/// One classification result, shaped for the HTTP API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub predicted_class: ConditionClass,
    pub predicted_class_index: usize,
    pub confidence: f32,
    /// Per-class probabilities keyed by class name
    pub probabilities: BTreeMap<String, f32>,
    pub maintenance_urgency: MaintenanceUrgency,
    pub recommendations: Vec<String>,
    /// Set when confidence falls below the configured threshold;
    /// never an error
    pub low_confidence: bool,
    pub model_version: String,
    /// Wall-clock inference time in seconds
    pub inference_time: f64,
}

/// Maintenance recommendations for a predicted class, with a manual-
/// inspection note appended for low-confidence predictions.
pub fn recommendations(class: ConditionClass, confidence: f32, threshold: f32) -> Vec<String> {
    let mut recs: Vec<String> = match class {
        ConditionClass::Excellent => vec![
            "Pavement is in excellent condition".into(),
            "Continue regular maintenance schedule".into(),
            "No immediate action required".into(),
        ],
        ConditionClass::Good => vec![
            "Pavement is in good condition".into(),
            "Monitor for any changes".into(),
            "Schedule routine inspection in 6 months".into(),
        ],
        ConditionClass::Fair => vec![
            "Pavement shows signs of wear".into(),
            "Consider preventive maintenance".into(),
            "Schedule detailed inspection within 3 months".into(),
            "Monitor crack development".into(),
        ],
        ConditionClass::Poor => vec![
            "Pavement requires maintenance attention".into(),
            "Schedule repair work within 1-2 months".into(),
            "Consider resurfacing or overlay".into(),
            "Restrict heavy vehicle access if possible".into(),
        ],
        ConditionClass::Failed => vec![
            "URGENT: Pavement in critical condition".into(),
            "Immediate repair or reconstruction required".into(),
            "Consider traffic restrictions".into(),
            "Safety inspection recommended".into(),
        ],
    };

    if confidence < threshold {
        recs.push(format!(
            "Note: Prediction confidence is {:.1}% - consider manual inspection",
            confidence * 100.0
        ));
    }
    recs
}

#[derive(Debug)]
enum PredictorInner {
    Single(LoadedBackbone<DefaultBackend>),
    Ensemble {
        members: Vec<LoadedBackbone<DefaultBackend>>,
        ensemble: Ensemble,
    },
}

// Safety: every parameter is fully materialized by `LoadedBackbone::load`
// before a predictor is shared, and `forward` only reads them. burn 0.15's
// `Param` holds a `OnceCell` and so lacks the `Sync` impl that later burn
// versions provide for this read-only case.
unsafe impl Sync for PredictorInner {}

/// Default cap on images per forward pass; see
/// `ServingConfig::max_batch_size`.
const DEFAULT_MAX_BATCH: usize = 8;

/// Loaded model (or ensemble) ready to classify image bytes.
#[derive(Debug)]
pub struct Predictor {
    inner: PredictorInner,
    image_size: usize,
    version: String,
    confidence_threshold: f32,
    max_batch: usize,
    device: burn_ndarray::NdArrayDevice,
}

impl Predictor {
    /// Load a registry version, resolving ensemble members recursively.
    pub fn from_registry(
        registry: &ModelRegistry,
        version: &str,
        confidence_threshold: f32,
    ) -> Result<Self> {
        let device = default_device();
        let entry = registry.get(version)?;

        match entry.metadata.kind {
            ArtifactKind::Model => {
                let spec = entry.spec.ok_or_else(|| {
                    PavementError::NotFound(format!("{} has no spec", version))
                })?;
                let weights = entry.weights.ok_or_else(|| {
                    PavementError::NotFound(format!("{} has no weights", version))
                })?;
                let model = LoadedBackbone::load(&spec, &weights, &device)?;
                Ok(Self {
                    inner: PredictorInner::Single(model),
                    image_size: spec.image_size,
                    version: version.to_string(),
                    confidence_threshold,
                    max_batch: DEFAULT_MAX_BATCH,
                    device,
                })
            }
            ArtifactKind::Ensemble => {
                let ensemble = entry.ensemble.ok_or_else(|| {
                    PavementError::NotFound(format!("{} has no ensemble record", version))
                })?;

                let mut members = Vec::with_capacity(ensemble.members.len());
                let mut image_size = None;
                for member_version in &ensemble.members {
                    let member = registry.get(member_version)?;
                    let spec = member.spec.ok_or_else(|| {
                        PavementError::Config(format!(
                            "ensemble member {} is not a model",
                            member_version
                        ))
                    })?;
                    let weights = member.weights.ok_or_else(|| {
                        PavementError::NotFound(format!("{} has no weights", member_version))
                    })?;
                    image_size.get_or_insert(spec.image_size);
                    members.push(LoadedBackbone::load(&spec, &weights, &device)?);
                }
                let image_size = image_size.ok_or_else(|| {
                    PavementError::Config("ensemble has no members".to_string())
                })?;

                Ok(Self {
                    inner: PredictorInner::Ensemble { members, ensemble },
                    image_size,
                    version: version.to_string(),
                    confidence_threshold,
                    max_batch: DEFAULT_MAX_BATCH,
                    device,
                })
            }
        }
    }

    /// Cap the number of images per forward pass. Larger batch
    /// requests are split into chunks of this size.
    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    /// Classify one image.
    pub fn predict(&self, image_bytes: &[u8]) -> Result<Prediction> {
        let start = Instant::now();
        let pixels = preprocess(image_bytes, self.image_size)?;
        let probs = self.probabilities(vec![pixels]);
        let probs = probs.into_iter().next().ok_or_else(|| {
            PavementError::Io(std::io::Error::other("model produced no output"))
        })?;
        Ok(self.build_prediction(probs?, start))
    }

    /// Classify a batch. Errors are per-item: one undecodable image
    /// does not fail its neighbors.
    pub fn predict_batch(&self, images: &[Vec<u8>]) -> Vec<Result<Prediction>> {
        let start = Instant::now();

        let decoded: Vec<Result<Vec<f32>>> = images
            .iter()
            .map(|bytes| preprocess(bytes, self.image_size))
            .collect();

        let valid: Vec<Vec<f32>> = decoded
            .iter()
            .filter_map(|r| r.as_ref().ok().cloned())
            .collect();
        let mut valid_probs = self.probabilities(valid).into_iter();

        decoded
            .into_iter()
            .map(|item| match item {
                Ok(_) => {
                    let probs = valid_probs.next().unwrap_or_else(|| {
                        Err(PavementError::Io(std::io::Error::other("missing model output")))
                    });
                    probs.map(|p| self.build_prediction(p, start))
                }
                Err(err) => Err(err),
            })
            .collect()
    }

    /// Softmax probabilities for pre-decoded pixel buffers. No forward
    /// pass sees more than `max_batch` images, so memory stays bounded
    /// for arbitrarily large requests.
    fn probabilities(&self, pixel_buffers: Vec<Vec<f32>>) -> Vec<Result<Vec<f32>>> {
        let mut results = Vec::with_capacity(pixel_buffers.len());
        if pixel_buffers.is_empty() {
            return results;
        }
        let batcher = SampleBatcher::<DefaultBackend>::new(self.device, self.image_size);
        for chunk in pixel_buffers.chunks(self.max_batch) {
            results.extend(self.forward_chunk(&batcher, chunk));
        }
        results
    }

    fn forward_chunk(
        &self,
        batcher: &SampleBatcher<DefaultBackend>,
        chunk: &[Vec<f32>],
    ) -> Vec<Result<Vec<f32>>> {
        let samples: Vec<Sample> = chunk
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, pixels)| {
                Sample::new(
                    i as u64,
                    pixels,
                    self.image_size,
                    ConditionClass::Excellent, // placeholder label, unused
                    None,
                    Provenance::Real,
                )
            })
            .collect();
        let n = samples.len();
        let batch = batcher.batch(samples);

        match &self.inner {
            PredictorInner::Single(model) => {
                let probs = softmax(model.forward(batch.images).condition, 1);
                rows_of(probs, n).into_iter().map(Ok).collect()
            }
            PredictorInner::Ensemble { members, ensemble } => {
                let member_rows: Vec<Vec<Vec<f32>>> = members
                    .iter()
                    .map(|m| {
                        let probs = softmax(m.forward(batch.images.clone()).condition, 1);
                        rows_of(probs, n)
                    })
                    .collect();

                (0..n)
                    .map(|i| {
                        let per_member: Vec<Vec<f32>> =
                            member_rows.iter().map(|m| m[i].clone()).collect();
                        ensemble.combine(&per_member)
                    })
                    .collect()
            }
        }
    }

    fn build_prediction(&self, probs: Vec<f32>, start: Instant) -> Prediction {
        let (index, confidence) = probs
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::MIN), |acc, (i, v)| if v > acc.1 { (i, v) } else { acc });
        let class = ConditionClass::from_index(index).unwrap_or(ConditionClass::Failed);

        let probabilities: BTreeMap<String, f32> = ConditionClass::ALL
            .iter()
            .map(|c| (c.as_str().to_string(), probs[c.index()]))
            .collect();

        Prediction {
            predicted_class: class,
            predicted_class_index: index,
            confidence,
            probabilities,
            maintenance_urgency: class.urgency(),
            recommendations: recommendations(class, confidence, self.confidence_threshold),
            low_confidence: confidence < self.confidence_threshold,
            model_version: self.version.clone(),
            inference_time: start.elapsed().as_secs_f64(),
        }
    }
}

fn rows_of(probs: burn::tensor::Tensor<DefaultBackend, 2>, n: usize) -> Vec<Vec<f32>> {
    let [rows, cols] = probs.dims();
    debug_assert_eq!(rows, n);
    let flat: Vec<f32> = probs
        .into_data()
        .to_vec()
        .expect("softmax output is contiguous float data");
    (0..rows)
        .map(|r| flat[r * cols..(r + 1) * cols].to_vec())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::synthetic::{generate_sample, SyntheticConfig};
    use crate::evaluation::evaluate_predictions;
    use crate::model::ArchitectureSpec;
    use crate::model::conv::MobileLightNet;
    use burn::module::Module;
    use burn::record::CompactRecorder;
    use image::{Rgb, RgbImage};
    use std::io::Cursor;

    fn registry_with_model(dir: &std::path::Path) -> (ModelRegistry, String) {
        let device = default_device();
        let registry = ModelRegistry::open(dir.join("registry")).unwrap();
        let spec = ArchitectureSpec::mobile_light(16);
        let model = MobileLightNet::<DefaultBackend>::new(&spec, &device);
        model
            .save_file(dir.join("staged"), &CompactRecorder::new())
            .unwrap();
        let report = evaluate_predictions(&[], &[]);
        let version = registry
            .register_model(&spec, &dir.join("staged.mpk"), &report, None)
            .unwrap();
        (registry, version)
    }

    fn sample_png() -> Vec<u8> {
        let config = SyntheticConfig {
            samples_per_class: 1,
            image_size: 16,
            seed: 3,
        };
        let sample = generate_sample(ConditionClass::Good, 0, &config);
        let mut img = RgbImage::new(16, 16);
        for y in 0..16usize {
            for x in 0..16usize {
                let v = (sample.pixels[y * 16 + x] * 255.0) as u8;
                img.put_pixel(x as u32, y as u32, Rgb([v, v, v]));
            }
        }
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_predict_shape_and_determinism() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, version) = registry_with_model(dir.path());
        let predictor = Predictor::from_registry(&registry, &version, 0.7).unwrap();

        let bytes = sample_png();
        let a = predictor.predict(&bytes).unwrap();
        let b = predictor.predict(&bytes).unwrap();

        assert_eq!(a.predicted_class, b.predicted_class);
        assert_eq!(a.probabilities, b.probabilities);
        assert_eq!(a.model_version, version);

        let sum: f32 = a.probabilities.values().sum();
        assert!((sum - 1.0).abs() < 1e-4);
        assert_eq!(a.maintenance_urgency, a.predicted_class.urgency());
    }

    #[test]
    fn test_batch_matches_single() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, version) = registry_with_model(dir.path());
        let predictor = Predictor::from_registry(&registry, &version, 0.7).unwrap();

        let bytes = sample_png();
        let single = predictor.predict(&bytes).unwrap();
        let batch = predictor.predict_batch(&[bytes.clone(), bytes.clone()]);

        for result in &batch {
            let p = result.as_ref().unwrap();
            assert_eq!(p.predicted_class, single.predicted_class);
            for (class, prob) in &p.probabilities {
                let expected = single.probabilities[class];
                assert!((prob - expected).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_oversized_batch_is_chunked_and_matches_single() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, version) = registry_with_model(dir.path());
        let predictor = Predictor::from_registry(&registry, &version, 0.7)
            .unwrap()
            .with_max_batch(2);

        let bytes = sample_png();
        let single = predictor.predict(&bytes).unwrap();

        // Five valid images plus one bad one straddle chunk boundaries
        let images = vec![
            bytes.clone(),
            bytes.clone(),
            b"not an image".to_vec(),
            bytes.clone(),
            bytes.clone(),
            bytes.clone(),
        ];
        let results = predictor.predict_batch(&images);
        assert_eq!(results.len(), 6);
        assert!(matches!(results[2], Err(PavementError::Decode(_))));

        for result in [&results[0], &results[1], &results[3], &results[4], &results[5]] {
            let p = result.as_ref().unwrap();
            assert_eq!(p.predicted_class, single.predicted_class);
            for (class, prob) in &p.probabilities {
                assert!((prob - single.probabilities[class]).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_batch_errors_are_per_item() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, version) = registry_with_model(dir.path());
        let predictor = Predictor::from_registry(&registry, &version, 0.7).unwrap();

        let results = predictor.predict_batch(&[
            sample_png(),
            b"not an image".to_vec(),
            sample_png(),
        ]);

        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(PavementError::Decode(_))));
        assert!(results[2].is_ok());
    }

    #[test]
    fn test_missing_version_has_no_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _version) = registry_with_model(dir.path());
        let err = Predictor::from_registry(&registry, "v0099", 0.7).unwrap_err();
        assert!(matches!(err, PavementError::NotFound(_)));
    }

    #[test]
    fn test_recommendations_pure() {
        let high = recommendations(ConditionClass::Failed, 0.95, 0.7);
        assert!(high[0].starts_with("URGENT"));
        assert_eq!(high.len(), 4);

        let low = recommendations(ConditionClass::Failed, 0.5, 0.7);
        assert_eq!(low.len(), 5);
        assert!(low[4].contains("manual inspection"));

        assert_eq!(recommendations(ConditionClass::Fair, 0.9, 0.7).len(), 4);
    }
}
