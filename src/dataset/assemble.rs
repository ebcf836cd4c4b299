//! Dataset assembly and stratified splitting.
//!
//! Merges real and synthetic samples into a single pool, then produces
//! disjoint, exhaustive train/validation/test partitions whose per-class
//! proportions stay within a configured tolerance of the pool.

use std::collections::HashMap;
use std::path::Path;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dataset::{ConditionClass, Sample};
use crate::error::{PavementError, Result};
use crate::NUM_CONDITION_CLASSES;

/// Configuration for dataset assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyConfig {
    /// Fraction of samples for training
    pub train_ratio: f64,
    /// Fraction of samples for validation
    pub val_ratio: f64,
    /// Fraction of samples for testing
    pub test_ratio: f64,
    /// Maximum absolute deviation of a partition's per-class fraction
    /// from the pool's per-class fraction
    pub tolerance: f64,
    /// Minimum samples required per class before splitting
    pub min_per_class: usize,
    /// Shuffle seed
    pub seed: u64,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            train_ratio: 0.8,
            val_ratio: 0.1,
            test_ratio: 0.1,
            tolerance: 0.15,
            min_per_class: 3,
            seed: 42,
        }
    }
}

impl AssemblyConfig {
    pub fn validate(&self) -> Result<()> {
        let sum = self.train_ratio + self.val_ratio + self.test_ratio;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(PavementError::Config(format!(
                "split ratios must sum to 1.0, got {:.4}",
                sum
            )));
        }
        if self.train_ratio <= 0.0 || self.val_ratio <= 0.0 || self.test_ratio <= 0.0 {
            return Err(PavementError::Config(
                "all split ratios must be positive".to_string(),
            ));
        }
        if self.tolerance <= 0.0 || self.tolerance >= 1.0 {
            return Err(PavementError::Config(format!(
                "tolerance must be in (0, 1), got {}",
                self.tolerance
            )));
        }
        if self.min_per_class < 3 {
            return Err(PavementError::Config(
                "min_per_class must be at least 3 (one per partition)".to_string(),
            ));
        }
        Ok(())
    }
}

/// The three partitions of an assembled dataset.
#[derive(Debug, Clone)]
pub struct DatasetSplit {
    pub train: Vec<Sample>,
    pub validation: Vec<Sample>,
    pub test: Vec<Sample>,
}

impl DatasetSplit {
    pub fn total(&self) -> usize {
        self.train.len() + self.validation.len() + self.test.len()
    }

    pub fn stats(&self) -> SplitStats {
        SplitStats {
            train: partition_counts(&self.train),
            validation: partition_counts(&self.validation),
            test: partition_counts(&self.test),
        }
    }

    /// Persist the partition membership (sample ids only) for
    /// reproducibility audits.
    pub fn save_manifest(&self, path: &Path) -> Result<()> {
        let manifest = SplitManifest {
            train_ids: self.train.iter().map(|s| s.id).collect(),
            validation_ids: self.validation.iter().map(|s| s.id).collect(),
            test_ids: self.test.iter().map(|s| s.id).collect(),
        };
        std::fs::write(path, serde_json::to_string_pretty(&manifest)?)?;
        Ok(())
    }
}

/// Sample-id membership of a saved split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitManifest {
    pub train_ids: Vec<u64>,
    pub validation_ids: Vec<u64>,
    pub test_ids: Vec<u64>,
}

impl SplitManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

/// Per-partition class counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitStats {
    pub train: [usize; NUM_CONDITION_CLASSES],
    pub validation: [usize; NUM_CONDITION_CLASSES],
    pub test: [usize; NUM_CONDITION_CLASSES],
}

impl std::fmt::Display for SplitStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{:<12} {:>8} {:>8} {:>8}", "class", "train", "val", "test")?;
        for class in ConditionClass::ALL {
            let i = class.index();
            writeln!(
                f,
                "{:<12} {:>8} {:>8} {:>8}",
                class.as_str(),
                self.train[i],
                self.validation[i],
                self.test[i]
            )?;
        }
        Ok(())
    }
}

fn partition_counts(samples: &[Sample]) -> [usize; NUM_CONDITION_CLASSES] {
    let mut counts = [0usize; NUM_CONDITION_CLASSES];
    for sample in samples {
        counts[sample.condition.index()] += 1;
    }
    counts
}

/// Assemble a stratified train/validation/test split.
///
/// Fails fast with `InsufficientData` when a class is below the
/// configured floor, and with `Stratification` when the resulting
/// partitions drift outside the tolerance. There is no silent
/// rebalancing.
pub fn assemble_dataset(samples: Vec<Sample>, config: &AssemblyConfig) -> Result<DatasetSplit> {
    config.validate()?;

    if samples.is_empty() {
        return Err(PavementError::InsufficientData(
            "no samples to assemble".to_string(),
        ));
    }

    // Group by class, preserving insertion order within groups
    let mut by_class: HashMap<usize, Vec<Sample>> = HashMap::new();
    for sample in samples {
        by_class.entry(sample.condition.index()).or_default().push(sample);
    }

    for (class_idx, group) in &by_class {
        if group.len() < config.min_per_class {
            let class = ConditionClass::from_index(*class_idx)
                .map(|c| c.as_str().to_string())
                .unwrap_or_else(|| class_idx.to_string());
            return Err(PavementError::InsufficientData(format!(
                "class '{}' has {} samples, need at least {}",
                class,
                group.len(),
                config.min_per_class
            )));
        }
    }

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut split = DatasetSplit {
        train: Vec::new(),
        validation: Vec::new(),
        test: Vec::new(),
    };

    // Deterministic class order so the seed fully determines the split
    let mut class_indices: Vec<usize> = by_class.keys().copied().collect();
    class_indices.sort_unstable();

    for class_idx in class_indices {
        let mut group = by_class.remove(&class_idx).unwrap_or_default();
        group.shuffle(&mut rng);

        let n = group.len();
        let mut n_train = (n as f64 * config.train_ratio).round() as usize;
        let mut n_val = (n as f64 * config.val_ratio).round() as usize;

        // Every partition keeps at least one sample per class
        n_train = n_train.clamp(1, n - 2);
        n_val = n_val.clamp(1, n - n_train - 1);

        let mut iter = group.into_iter();
        split.train.extend(iter.by_ref().take(n_train));
        split.validation.extend(iter.by_ref().take(n_val));
        split.test.extend(iter);
    }

    verify_stratification(&split, config.tolerance)?;

    let stats = split.stats();
    info!(
        "Assembled dataset: {} train / {} val / {} test\n{}",
        split.train.len(),
        split.validation.len(),
        split.test.len(),
        stats
    );

    Ok(split)
}

fn verify_stratification(split: &DatasetSplit, tolerance: f64) -> Result<()> {
    let total = split.total();
    let mut overall = [0usize; NUM_CONDITION_CLASSES];
    for counts in [
        partition_counts(&split.train),
        partition_counts(&split.validation),
        partition_counts(&split.test),
    ] {
        for (o, c) in overall.iter_mut().zip(counts.iter()) {
            *o += c;
        }
    }

    for (name, partition) in [
        ("train", &split.train),
        ("validation", &split.validation),
        ("test", &split.test),
    ] {
        let counts = partition_counts(partition);
        let part_total = partition.len().max(1);
        for class in ConditionClass::ALL {
            let i = class.index();
            let pool_frac = overall[i] as f64 / total as f64;
            let part_frac = counts[i] as f64 / part_total as f64;
            if (part_frac - pool_frac).abs() > tolerance {
                return Err(PavementError::Stratification(format!(
                    "class '{}' is {:.1}% of {} but {:.1}% of the pool (tolerance {:.0}%)",
                    class.as_str(),
                    part_frac * 100.0,
                    name,
                    pool_frac * 100.0,
                    tolerance * 100.0
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Provenance, Sample};
    use std::collections::HashSet;

    fn make_samples(per_class: usize) -> Vec<Sample> {
        let mut samples = Vec::new();
        let mut id = 0u64;
        for class in ConditionClass::ALL {
            for _ in 0..per_class {
                samples.push(Sample::new(
                    id,
                    vec![0.5f32; 3 * 4 * 4],
                    4,
                    class,
                    None,
                    Provenance::Synthetic,
                ));
                id += 1;
            }
        }
        samples
    }

    #[test]
    fn test_split_disjoint_and_exhaustive() {
        let samples = make_samples(50);
        let total = samples.len();
        let split = assemble_dataset(samples, &AssemblyConfig::default()).unwrap();

        assert_eq!(split.total(), total);

        let mut seen = HashSet::new();
        for sample in split
            .train
            .iter()
            .chain(&split.validation)
            .chain(&split.test)
        {
            assert!(seen.insert(sample.id), "duplicate sample id {}", sample.id);
        }
        assert_eq!(seen.len(), total);
    }

    #[test]
    fn test_split_ratios_respected() {
        let samples = make_samples(100);
        let split = assemble_dataset(samples, &AssemblyConfig::default()).unwrap();

        assert_eq!(split.train.len(), 400);
        assert_eq!(split.validation.len(), 50);
        assert_eq!(split.test.len(), 50);
    }

    #[test]
    fn test_split_deterministic() {
        let config = AssemblyConfig::default();
        let a = assemble_dataset(make_samples(20), &config).unwrap();
        let b = assemble_dataset(make_samples(20), &config).unwrap();

        let ids = |s: &[Sample]| s.iter().map(|x| x.id).collect::<Vec<_>>();
        assert_eq!(ids(&a.train), ids(&b.train));
        assert_eq!(ids(&a.test), ids(&b.test));

        let other = AssemblyConfig {
            seed: 7,
            ..AssemblyConfig::default()
        };
        let c = assemble_dataset(make_samples(20), &other).unwrap();
        assert_ne!(ids(&a.train), ids(&c.train));
    }

    #[test]
    fn test_insufficient_class_fails() {
        let mut samples = make_samples(10);
        // Strip 'failed' down to two samples
        samples.retain(|s| {
            s.condition != ConditionClass::Failed || s.id % 10 < 2
        });

        let err = assemble_dataset(samples, &AssemblyConfig::default()).unwrap_err();
        assert!(matches!(err, PavementError::InsufficientData(_)));
    }

    #[test]
    fn test_skewed_pool_breaches_tolerance() {
        // A three-sample class among four 200-sample classes: the
        // forced one-sample-per-partition slices overweight it in the
        // small partitions (1/81 in validation vs 3/803 in the pool),
        // which a tight tolerance must reject.
        let mut samples = make_samples(200);
        samples.retain(|s| s.condition != ConditionClass::Failed || s.id % 200 < 3);

        let config = AssemblyConfig {
            tolerance: 0.005,
            ..AssemblyConfig::default()
        };
        let err = assemble_dataset(samples, &config).unwrap_err();
        assert!(matches!(err, PavementError::Stratification(_)), "got {err:?}");
    }

    #[test]
    fn test_bad_ratios_rejected() {
        let config = AssemblyConfig {
            train_ratio: 0.8,
            val_ratio: 0.3,
            test_ratio: 0.1,
            ..AssemblyConfig::default()
        };
        let err = assemble_dataset(make_samples(10), &config).unwrap_err();
        assert!(matches!(err, PavementError::Config(_)));
    }

    #[test]
    fn test_manifest_round_trip() {
        let split = assemble_dataset(make_samples(10), &AssemblyConfig::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("split.json");

        split.save_manifest(&path).unwrap();
        let manifest = SplitManifest::load(&path).unwrap();

        assert_eq!(manifest.train_ids.len(), split.train.len());
        assert_eq!(manifest.test_ids.len(), split.test.len());
    }
}
