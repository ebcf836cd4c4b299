//! Versioned model registry.
//!
//! Layout on disk, one directory per version:
//!
//! ```text
//! registry/
//!   v0001/
//!     weights.mpk      (models only)
//!     spec.json        (models only)
//!     ensemble.json    (ensembles only)
//!     report.json
//!     metadata.json
//!   production.json
//! ```
//!
//! Versions are monotonic and never overwritten; promoting a version to
//! production is an explicit operation that rewrites the pointer file
//! only.

use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::record::{BinFileRecorder, HalfPrecisionSettings};
use burn::tensor::backend::Backend;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::ensemble::Ensemble;
use crate::error::{PavementError, Result};
use crate::evaluation::EvaluationReport;
use crate::model::{ArchitectureSpec, LoadedBackbone};

/// Size budget for mobile exports.
pub const MOBILE_EXPORT_BUDGET_BYTES: u64 = 16 * 1024 * 1024;

/// What a registry version contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Model,
    Ensemble,
}

/// Metadata stored beside every artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub version: String,
    pub kind: ArtifactKind,
    pub created_at: DateTime<Utc>,
    /// Experiment that produced the weights, for models
    pub experiment_id: Option<Uuid>,
    /// Test accuracy snapshot, for quick listing
    pub accuracy: Option<f64>,
}

/// A fully resolved registry entry.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub metadata: ArtifactMetadata,
    pub spec: Option<ArchitectureSpec>,
    pub ensemble: Option<Ensemble>,
    pub report: Option<EvaluationReport>,
    /// Weights path without the recorder extension, for `load_file`
    pub weights: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProductionPointer {
    version: String,
    updated_at: DateTime<Utc>,
}

/// On-disk registry rooted at a directory.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    root: PathBuf,
}

impl ModelRegistry {
    /// Open (creating if needed) a registry at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn version_dir(&self, version: &str) -> PathBuf {
        self.root.join(version)
    }

    /// Next monotonic version id (`v0001`, `v0002`, ...).
    fn next_version(&self) -> Result<String> {
        let mut max = 0u32;
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(digits) = name.strip_prefix('v') {
                if let Ok(n) = digits.parse::<u32>() {
                    max = max.max(n);
                }
            }
        }
        Ok(format!("v{:04}", max + 1))
    }

    /// Register a trained model. `staged_weights` is the weight file
    /// written by the trainer (CompactRecorder `.mpk`). The file is
    /// copied; the staging copy stays untouched.
    pub fn register_model(
        &self,
        spec: &ArchitectureSpec,
        staged_weights: &Path,
        report: &EvaluationReport,
        experiment_id: Option<Uuid>,
    ) -> Result<String> {
        let version = self.next_version()?;
        let dir = self.claim_version_dir(&version)?;

        std::fs::copy(staged_weights, dir.join("weights.mpk"))?;
        std::fs::write(dir.join("spec.json"), serde_json::to_string_pretty(spec)?)?;
        report.save(&dir.join("report.json"))?;

        let metadata = ArtifactMetadata {
            version: version.clone(),
            kind: ArtifactKind::Model,
            created_at: Utc::now(),
            experiment_id,
            accuracy: Some(report.accuracy),
        };
        std::fs::write(
            dir.join("metadata.json"),
            serde_json::to_string_pretty(&metadata)?,
        )?;

        info!("Registered model '{}' as {}", spec.name, version);
        Ok(version)
    }

    /// Register an ensemble over already registered versions.
    pub fn register_ensemble(&self, ensemble: &Ensemble, report: &EvaluationReport) -> Result<String> {
        for member in &ensemble.members {
            // Members must exist; an ensemble of dangling ids is useless
            self.get(member)?;
        }

        let version = self.next_version()?;
        let dir = self.claim_version_dir(&version)?;

        std::fs::write(
            dir.join("ensemble.json"),
            serde_json::to_string_pretty(ensemble)?,
        )?;
        report.save(&dir.join("report.json"))?;

        let metadata = ArtifactMetadata {
            version: version.clone(),
            kind: ArtifactKind::Ensemble,
            created_at: Utc::now(),
            experiment_id: None,
            accuracy: Some(report.accuracy),
        };
        std::fs::write(
            dir.join("metadata.json"),
            serde_json::to_string_pretty(&metadata)?,
        )?;

        info!(
            "Registered ensemble over {:?} as {}",
            ensemble.members, version
        );
        Ok(version)
    }

    fn claim_version_dir(&self, version: &str) -> Result<PathBuf> {
        let dir = self.version_dir(version);
        if dir.exists() {
            return Err(PavementError::AlreadyExists(format!(
                "registry version {} already exists",
                version
            )));
        }
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Resolve a version. `NotFound` when it does not exist; there is
    /// no fallback to other versions.
    pub fn get(&self, version: &str) -> Result<RegistryEntry> {
        let dir = self.version_dir(version);
        let metadata_path = dir.join("metadata.json");
        if !metadata_path.exists() {
            return Err(PavementError::NotFound(format!(
                "model version {}",
                version
            )));
        }

        let metadata: ArtifactMetadata =
            serde_json::from_str(&std::fs::read_to_string(&metadata_path)?)?;

        let spec = match metadata.kind {
            ArtifactKind::Model => Some(serde_json::from_str(&std::fs::read_to_string(
                dir.join("spec.json"),
            )?)?),
            ArtifactKind::Ensemble => None,
        };
        let ensemble = match metadata.kind {
            ArtifactKind::Ensemble => Some(serde_json::from_str(&std::fs::read_to_string(
                dir.join("ensemble.json"),
            )?)?),
            ArtifactKind::Model => None,
        };
        let report_path = dir.join("report.json");
        let report = if report_path.exists() {
            Some(EvaluationReport::load(&report_path)?)
        } else {
            None
        };
        let weights = matches!(metadata.kind, ArtifactKind::Model).then(|| dir.join("weights"));

        Ok(RegistryEntry {
            metadata,
            spec,
            ensemble,
            report,
            weights,
        })
    }

    /// All versions, oldest first.
    pub fn list(&self) -> Result<Vec<ArtifactMetadata>> {
        let mut versions = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let metadata_path = entry.path().join("metadata.json");
            if metadata_path.exists() {
                versions.push(serde_json::from_str::<ArtifactMetadata>(
                    &std::fs::read_to_string(&metadata_path)?,
                )?);
            }
        }
        versions.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(versions)
    }

    /// Promote a version to production. The version must exist.
    pub fn set_production(&self, version: &str) -> Result<()> {
        self.get(version)?;
        let pointer = ProductionPointer {
            version: version.to_string(),
            updated_at: Utc::now(),
        };
        std::fs::write(
            self.root.join("production.json"),
            serde_json::to_string_pretty(&pointer)?,
        )?;
        info!("Production model is now {}", version);
        Ok(())
    }

    /// Current production version, if one was promoted.
    pub fn production(&self) -> Result<Option<String>> {
        let path = self.root.join("production.json");
        if !path.exists() {
            return Ok(None);
        }
        let pointer: ProductionPointer = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        Ok(Some(pointer.version))
    }

    /// Export a model version as a half-precision binary record for
    /// mobile deployment. Fails when the result exceeds the size
    /// budget; the partial file is removed in that case.
    pub fn export_mobile<B: Backend>(
        &self,
        version: &str,
        dest: &Path,
        device: &B::Device,
    ) -> Result<u64> {
        let entry = self.get(version)?;
        let spec = entry.spec.ok_or_else(|| {
            PavementError::Export(format!("{} is an ensemble, not an exportable model", version))
        })?;
        let weights = entry
            .weights
            .ok_or_else(|| PavementError::Export(format!("{} has no weights", version)))?;

        let model = LoadedBackbone::<B>::load(&spec, &weights, device)?;
        let recorder = BinFileRecorder::<HalfPrecisionSettings>::new();
        let map_err = |e: burn::record::RecorderError| PavementError::Export(e.to_string());

        match model {
            LoadedBackbone::ConvResidual(m) => {
                m.save_file(dest, &recorder).map_err(map_err)?
            }
            LoadedBackbone::AttentionConv(m) => {
                m.save_file(dest, &recorder).map_err(map_err)?
            }
            LoadedBackbone::VisionTransformer(m) => {
                m.save_file(dest, &recorder).map_err(map_err)?
            }
            LoadedBackbone::MobileLight(m) => {
                m.save_file(dest, &recorder).map_err(map_err)?
            }
        }

        let exported = dest.with_extension("bin");
        let size = std::fs::metadata(&exported)?.len();
        if size > MOBILE_EXPORT_BUDGET_BYTES {
            std::fs::remove_file(&exported)?;
            return Err(PavementError::Export(format!(
                "exported model is {} bytes, budget is {}",
                size, MOBILE_EXPORT_BUDGET_BYTES
            )));
        }

        info!("Exported {} for mobile ({} bytes)", version, size);
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{default_device, DefaultBackend};
    use crate::dataset::ConditionClass;
    use crate::evaluation::evaluate_predictions;
    use crate::model::conv::MobileLightNet;
    use burn::record::CompactRecorder;

    fn dummy_report() -> EvaluationReport {
        evaluate_predictions(
            &[ConditionClass::Good, ConditionClass::Poor],
            &[ConditionClass::Good, ConditionClass::Poor],
        )
    }

    fn stage_weights(dir: &Path) -> (ArchitectureSpec, PathBuf) {
        let device = default_device();
        let spec = ArchitectureSpec::mobile_light(16);
        let model = MobileLightNet::<DefaultBackend>::new(&spec, &device);
        model
            .save_file(dir.join("staged"), &CompactRecorder::new())
            .unwrap();
        (spec, dir.join("staged.mpk"))
    }

    #[test]
    fn test_register_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::open(dir.path().join("registry")).unwrap();
        let (spec, staged) = stage_weights(dir.path());

        let version = registry
            .register_model(&spec, &staged, &dummy_report(), None)
            .unwrap();
        assert_eq!(version, "v0001");

        let entry = registry.get(&version).unwrap();
        assert_eq!(entry.metadata.kind, ArtifactKind::Model);
        assert_eq!(entry.spec.as_ref().unwrap(), &spec);
        assert!(entry.report.is_some());

        let stored = entry.weights.unwrap().with_extension("mpk");
        assert_eq!(
            std::fs::read(&staged).unwrap(),
            std::fs::read(&stored).unwrap()
        );
    }

    #[test]
    fn test_versions_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::open(dir.path().join("registry")).unwrap();
        let (spec, staged) = stage_weights(dir.path());

        let v1 = registry
            .register_model(&spec, &staged, &dummy_report(), None)
            .unwrap();
        let v2 = registry
            .register_model(&spec, &staged, &dummy_report(), None)
            .unwrap();
        assert_eq!((v1.as_str(), v2.as_str()), ("v0001", "v0002"));

        let listed = registry.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].version, "v0001");
    }

    #[test]
    fn test_get_missing_version() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::open(dir.path()).unwrap();
        let err = registry.get("v0042").unwrap_err();
        assert!(matches!(err, PavementError::NotFound(_)));
    }

    #[test]
    fn test_no_silent_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::open(dir.path().join("registry")).unwrap();

        // Simulate a concurrent writer claiming the next version
        std::fs::create_dir_all(registry.root().join("v0001")).unwrap();
        let err = registry.claim_version_dir("v0001").unwrap_err();
        assert!(matches!(err, PavementError::AlreadyExists(_)));
    }

    #[test]
    fn test_production_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::open(dir.path().join("registry")).unwrap();
        let (spec, staged) = stage_weights(dir.path());

        assert_eq!(registry.production().unwrap(), None);

        let err = registry.set_production("v0009").unwrap_err();
        assert!(matches!(err, PavementError::NotFound(_)));

        let version = registry
            .register_model(&spec, &staged, &dummy_report(), None)
            .unwrap();
        registry.set_production(&version).unwrap();
        assert_eq!(registry.production().unwrap(), Some(version));
    }

    #[test]
    fn test_ensemble_members_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::open(dir.path().join("registry")).unwrap();

        let ensemble = Ensemble::average(vec!["v0001".into()]);
        let err = registry
            .register_ensemble(&ensemble, &dummy_report())
            .unwrap_err();
        assert!(matches!(err, PavementError::NotFound(_)));
    }

    #[test]
    fn test_mobile_export_under_budget() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::open(dir.path().join("registry")).unwrap();
        let (spec, staged) = stage_weights(dir.path());
        let device = default_device();

        let version = registry
            .register_model(&spec, &staged, &dummy_report(), None)
            .unwrap();
        let size = registry
            .export_mobile::<DefaultBackend>(&version, &dir.path().join("mobile"), &device)
            .unwrap();

        assert!(size > 0);
        assert!(size <= MOBILE_EXPORT_BUDGET_BYTES);
        assert!(dir.path().join("mobile.bin").exists());
    }
}
