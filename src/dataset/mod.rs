//! Dataset types and Burn integration.
//!
//! Defines the label sets, the in-memory [`Sample`] representation
//! (decoded CHW floats), and the Burn `Batcher` glue used by the
//! training loop.

pub mod assemble;
pub mod preprocess;
pub mod synthetic;

use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{IMAGE_CHANNELS, NUM_CONDITION_CLASSES, NUM_CRACK_CLASSES};

pub use assemble::{assemble_dataset, AssemblyConfig, DatasetSplit, SplitStats};
pub use preprocess::{augment, preprocess, AugmentationPolicy};
pub use synthetic::{export_png_dataset, generate_synthetic_dataset, SyntheticConfig};

/// Pavement condition classes, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionClass {
    Excellent,
    Good,
    Fair,
    Poor,
    Failed,
}

impl ConditionClass {
    /// All classes in index order.
    pub const ALL: [ConditionClass; NUM_CONDITION_CLASSES] = [
        ConditionClass::Excellent,
        ConditionClass::Good,
        ConditionClass::Fair,
        ConditionClass::Poor,
        ConditionClass::Failed,
    ];

    /// Class index in the model's output layer.
    pub fn index(self) -> usize {
        match self {
            ConditionClass::Excellent => 0,
            ConditionClass::Good => 1,
            ConditionClass::Fair => 2,
            ConditionClass::Poor => 3,
            ConditionClass::Failed => 4,
        }
    }

    /// Class from model output index.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConditionClass::Excellent => "excellent",
            ConditionClass::Good => "good",
            ConditionClass::Fair => "fair",
            ConditionClass::Poor => "poor",
            ConditionClass::Failed => "failed",
        }
    }

    /// Maintenance urgency implied by the condition.
    pub fn urgency(self) -> MaintenanceUrgency {
        match self {
            ConditionClass::Excellent | ConditionClass::Good => MaintenanceUrgency::Low,
            ConditionClass::Fair => MaintenanceUrgency::Medium,
            ConditionClass::Poor => MaintenanceUrgency::High,
            ConditionClass::Failed => MaintenanceUrgency::Critical,
        }
    }
}

impl std::fmt::Display for ConditionClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Crack types for the auxiliary classification head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrackType {
    NoCracks,
    Longitudinal,
    Transverse,
    Alligator,
    Block,
    Pothole,
}

impl CrackType {
    pub const ALL: [CrackType; NUM_CRACK_CLASSES] = [
        CrackType::NoCracks,
        CrackType::Longitudinal,
        CrackType::Transverse,
        CrackType::Alligator,
        CrackType::Block,
        CrackType::Pothole,
    ];

    pub fn index(self) -> usize {
        match self {
            CrackType::NoCracks => 0,
            CrackType::Longitudinal => 1,
            CrackType::Transverse => 2,
            CrackType::Alligator => 3,
            CrackType::Block => 4,
            CrackType::Pothole => 5,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CrackType::NoCracks => "no_cracks",
            CrackType::Longitudinal => "longitudinal",
            CrackType::Transverse => "transverse",
            CrackType::Alligator => "alligator",
            CrackType::Block => "block",
            CrackType::Pothole => "pothole",
        }
    }
}

/// Maintenance urgency tiers derived from the predicted condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceUrgency {
    Low,
    Medium,
    High,
    Critical,
}

impl MaintenanceUrgency {
    pub fn as_str(self) -> &'static str {
        match self {
            MaintenanceUrgency::Low => "low",
            MaintenanceUrgency::Medium => "medium",
            MaintenanceUrgency::High => "high",
            MaintenanceUrgency::Critical => "critical",
        }
    }
}

/// Where a sample came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Synthetic,
    Real,
}

/// Optional capture metadata attached to real-world samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    /// Free-form location descriptor (road id, GPS string, ...)
    pub location: Option<String>,
    /// RFC 3339 capture timestamp
    pub captured_at: Option<String>,
}

/// A single labeled sample, fully decoded and ready for batching.
///
/// `pixels` holds CHW floats in `[0, 1]`, length `3 * size * size`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    /// Stable id, unique within a dataset
    pub id: u64,
    /// Flattened CHW pixel data
    pub pixels: Vec<f32>,
    /// Square image side length
    pub size: usize,
    /// Condition label
    pub condition: ConditionClass,
    /// Crack label, if annotated
    pub crack: Option<CrackType>,
    /// Origin of the sample
    pub provenance: Provenance,
    /// Capture metadata for real samples
    pub metadata: Option<CaptureMetadata>,
}

impl Sample {
    pub fn new(
        id: u64,
        pixels: Vec<f32>,
        size: usize,
        condition: ConditionClass,
        crack: Option<CrackType>,
        provenance: Provenance,
    ) -> Self {
        debug_assert_eq!(pixels.len(), IMAGE_CHANNELS * size * size);
        Self {
            id,
            pixels,
            size,
            condition,
            crack,
            provenance,
            metadata: None,
        }
    }
}

/// A batch of samples ready for a forward pass.
#[derive(Clone, Debug)]
pub struct SampleBatch<B: Backend> {
    /// Images with shape [batch_size, 3, size, size]
    pub images: Tensor<B, 4>,
    /// Condition targets with shape [batch_size]
    pub conditions: Tensor<B, 1, Int>,
    /// Crack targets, present only when every item carries a crack label
    pub cracks: Option<Tensor<B, 1, Int>>,
}

/// Batcher turning samples into normalized tensors.
#[derive(Clone, Debug)]
pub struct SampleBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
}

/// ImageNet channel means, applied after scaling to [0, 1].
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet channel standard deviations.
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

impl<B: Backend> SampleBatcher<B> {
    pub fn new(device: B::Device, image_size: usize) -> Self {
        Self { device, image_size }
    }
}

impl<B: Backend> Batcher<Sample, SampleBatch<B>> for SampleBatcher<B> {
    fn batch(&self, items: Vec<Sample>) -> SampleBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;

        let images_data: Vec<f32> = items.iter().flat_map(|s| s.pixels.clone()).collect();
        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(images_data, [batch_size, IMAGE_CHANNELS, size, size]),
            &self.device,
        );

        // Channel-wise normalization: (x - mean) / std
        let mean = Tensor::<B, 4>::from_floats(
            TensorData::new(IMAGENET_MEAN.to_vec(), [1, 3, 1, 1]),
            &self.device,
        );
        let std = Tensor::<B, 4>::from_floats(
            TensorData::new(IMAGENET_STD.to_vec(), [1, 3, 1, 1]),
            &self.device,
        );
        let images = (images - mean) / std;

        let conditions_data: Vec<i64> = items.iter().map(|s| s.condition.index() as i64).collect();
        let conditions = Tensor::<B, 1, Int>::from_data(
            TensorData::new(conditions_data, [batch_size]),
            &self.device,
        );

        let cracks = if items.iter().all(|s| s.crack.is_some()) && !items.is_empty() {
            let cracks_data: Vec<i64> = items
                .iter()
                .filter_map(|s| s.crack.map(|c| c.index() as i64))
                .collect();
            Some(Tensor::<B, 1, Int>::from_data(
                TensorData::new(cracks_data, [batch_size]),
                &self.device,
            ))
        } else {
            None
        };

        SampleBatch {
            images,
            conditions,
            cracks,
        }
    }
}

/// Load real labeled images from `<dir>/<condition>/*` into samples.
///
/// Ids continue from `first_id` so real and synthetic samples can share
/// one pool without collisions. Files that fail to decode are skipped
/// with a warning rather than aborting the whole load.
pub fn load_real_dataset(
    dir: &std::path::Path,
    image_size: usize,
    first_id: u64,
) -> crate::error::Result<Vec<Sample>> {
    let mut samples = Vec::new();
    let mut next_id = first_id;

    for condition in ConditionClass::ALL {
        let class_dir = dir.join(condition.as_str());
        if !class_dir.is_dir() {
            continue;
        }
        let mut paths: Vec<_> = std::fs::read_dir(&class_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        paths.sort();

        for path in paths {
            let bytes = std::fs::read(&path)?;
            match preprocess(&bytes, image_size) {
                Ok(pixels) => {
                    samples.push(Sample::new(
                        next_id,
                        pixels,
                        image_size,
                        condition,
                        None,
                        Provenance::Real,
                    ));
                    next_id += 1;
                }
                Err(err) => {
                    tracing::warn!("Skipping {}: {}", path.display(), err);
                }
            }
        }
    }

    tracing::info!("Loaded {} real samples from {}", samples.len(), dir.display());
    Ok(samples)
}

/// Chunk samples into batches of at most `batch_size`.
pub fn make_batches<B: Backend>(
    samples: &[Sample],
    batch_size: usize,
    batcher: &SampleBatcher<B>,
) -> Vec<SampleBatch<B>> {
    samples
        .chunks(batch_size.max(1))
        .map(|chunk| batcher.batch(chunk.to_vec()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{default_device, DefaultBackend};

    fn dummy_sample(id: u64, condition: ConditionClass, crack: Option<CrackType>) -> Sample {
        Sample::new(id, vec![0.5f32; 3 * 8 * 8], 8, condition, crack, Provenance::Synthetic)
    }

    #[test]
    fn test_condition_class_round_trip() {
        for class in ConditionClass::ALL {
            assert_eq!(ConditionClass::from_index(class.index()), Some(class));
        }
        assert_eq!(ConditionClass::from_index(5), None);
    }

    #[test]
    fn test_urgency_mapping() {
        assert_eq!(ConditionClass::Excellent.urgency(), MaintenanceUrgency::Low);
        assert_eq!(ConditionClass::Good.urgency(), MaintenanceUrgency::Low);
        assert_eq!(ConditionClass::Fair.urgency(), MaintenanceUrgency::Medium);
        assert_eq!(ConditionClass::Poor.urgency(), MaintenanceUrgency::High);
        assert_eq!(ConditionClass::Failed.urgency(), MaintenanceUrgency::Critical);
    }

    #[test]
    fn test_batcher_shapes() {
        let device = default_device();
        let batcher = SampleBatcher::<DefaultBackend>::new(device, 8);

        let batch = batcher.batch(vec![
            dummy_sample(0, ConditionClass::Good, Some(CrackType::NoCracks)),
            dummy_sample(1, ConditionClass::Poor, Some(CrackType::Pothole)),
        ]);

        assert_eq!(batch.images.dims(), [2, 3, 8, 8]);
        assert_eq!(batch.conditions.dims(), [2]);
        assert!(batch.cracks.is_some());
    }

    #[test]
    fn test_batcher_drops_cracks_when_partial() {
        let device = default_device();
        let batcher = SampleBatcher::<DefaultBackend>::new(device, 8);

        let batch = batcher.batch(vec![
            dummy_sample(0, ConditionClass::Good, Some(CrackType::NoCracks)),
            dummy_sample(1, ConditionClass::Poor, None),
        ]);

        assert!(batch.cracks.is_none());
    }

    #[test]
    fn test_make_batches_chunking() {
        let device = default_device();
        let batcher = SampleBatcher::<DefaultBackend>::new(device, 8);
        let samples: Vec<Sample> = (0..5)
            .map(|i| dummy_sample(i, ConditionClass::Fair, None))
            .collect();

        let batches = make_batches(&samples, 2, &batcher);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].images.dims()[0], 1);
    }
}
