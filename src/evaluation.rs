//! Evaluation metrics.
//!
//! Standard classification metrics (accuracy, per-class precision and
//! recall, macro F1, confusion matrix) extended with road-maintenance
//! metrics: urgency-tier accuracy and an expected misclassification
//! cost. The cost matrix is asymmetric on purpose: calling a failed
//! road excellent costs far more than the reverse.

use std::path::Path;

use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};

use crate::dataset::{ConditionClass, Sample, SampleBatcher};
use crate::error::Result;
use crate::NUM_CONDITION_CLASSES;

/// Dollar-denominated cost of predicting column when the truth is the
/// row, per inspected segment. Rows and columns follow class index
/// order (excellent..failed).
pub const MAINTENANCE_COST_MATRIX: [[f64; NUM_CONDITION_CLASSES]; NUM_CONDITION_CLASSES] = [
    [0.0, 50.0, 100.0, 500.0, 1000.0],
    [100.0, 0.0, 50.0, 400.0, 900.0],
    [300.0, 100.0, 0.0, 200.0, 700.0],
    [800.0, 500.0, 300.0, 0.0, 300.0],
    [2000.0, 1500.0, 1000.0, 500.0, 0.0],
];

/// Per-class precision/recall/F1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub class: ConditionClass,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// Full evaluation result for one model on one sample set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub accuracy: f64,
    pub macro_f1: f64,
    pub per_class: Vec<ClassMetrics>,
    /// confusion_matrix[truth][prediction]
    pub confusion_matrix: Vec<Vec<usize>>,
    /// Fraction of samples whose predicted urgency tier matches
    pub urgency_accuracy: f64,
    /// Mean misclassification cost per sample
    pub expected_cost: f64,
    pub num_samples: usize,
}

impl EvaluationReport {
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

impl std::fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "accuracy {:.2}% | macro F1 {:.3} | urgency accuracy {:.2}% | expected cost ${:.0}/sample",
            self.accuracy * 100.0,
            self.macro_f1,
            self.urgency_accuracy * 100.0,
            self.expected_cost
        )?;
        for metrics in &self.per_class {
            writeln!(
                f,
                "  {:<12} P {:.3}  R {:.3}  F1 {:.3}  (n={})",
                metrics.class.as_str(),
                metrics.precision,
                metrics.recall,
                metrics.f1,
                metrics.support
            )?;
        }
        Ok(())
    }
}

/// Compute the report from paired truth/prediction labels.
pub fn evaluate_predictions(
    truths: &[ConditionClass],
    predictions: &[ConditionClass],
) -> EvaluationReport {
    assert_eq!(truths.len(), predictions.len());
    let n = truths.len();

    let mut confusion = vec![vec![0usize; NUM_CONDITION_CLASSES]; NUM_CONDITION_CLASSES];
    let mut correct = 0usize;
    let mut urgency_correct = 0usize;
    let mut total_cost = 0.0;

    for (truth, pred) in truths.iter().zip(predictions) {
        confusion[truth.index()][pred.index()] += 1;
        if truth == pred {
            correct += 1;
        }
        if truth.urgency() == pred.urgency() {
            urgency_correct += 1;
        }
        total_cost += MAINTENANCE_COST_MATRIX[truth.index()][pred.index()];
    }

    let mut per_class = Vec::with_capacity(NUM_CONDITION_CLASSES);
    let mut f1_sum = 0.0;
    let mut f1_count = 0usize;

    for class in ConditionClass::ALL {
        let i = class.index();
        let true_positives = confusion[i][i];
        let support: usize = confusion[i].iter().sum();
        let predicted: usize = confusion.iter().map(|row| row[i]).sum();

        let precision = if predicted > 0 {
            true_positives as f64 / predicted as f64
        } else {
            0.0
        };
        let recall = if support > 0 {
            true_positives as f64 / support as f64
        } else {
            0.0
        };
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };

        if support > 0 {
            f1_sum += f1;
            f1_count += 1;
        }
        per_class.push(ClassMetrics {
            class,
            precision,
            recall,
            f1,
            support,
        });
    }

    EvaluationReport {
        accuracy: if n > 0 { correct as f64 / n as f64 } else { 0.0 },
        macro_f1: if f1_count > 0 { f1_sum / f1_count as f64 } else { 0.0 },
        per_class,
        confusion_matrix: confusion,
        urgency_accuracy: if n > 0 {
            urgency_correct as f64 / n as f64
        } else {
            0.0
        },
        expected_cost: if n > 0 { total_cost / n as f64 } else { 0.0 },
        num_samples: n,
    }
}

/// Run a model over samples and compute the report. `forward` maps a
/// normalized image batch to condition logits.
pub fn evaluate_forward<B, F>(
    forward: F,
    samples: &[Sample],
    batch_size: usize,
    device: &B::Device,
) -> EvaluationReport
where
    B: Backend,
    F: Fn(Tensor<B, 4>) -> Tensor<B, 2>,
{
    let truths: Vec<ConditionClass> = samples.iter().map(|s| s.condition).collect();
    let predictions = predict_classes(forward, samples, batch_size, device);
    evaluate_predictions(&truths, &predictions)
}

/// Argmax predictions for a slice of samples, batched.
pub fn predict_classes<B, F>(
    forward: F,
    samples: &[Sample],
    batch_size: usize,
    device: &B::Device,
) -> Vec<ConditionClass>
where
    B: Backend,
    F: Fn(Tensor<B, 4>) -> Tensor<B, 2>,
{
    if samples.is_empty() {
        return Vec::new();
    }
    let batcher = SampleBatcher::<B>::new(device.clone(), samples[0].size);
    let mut predictions = Vec::with_capacity(samples.len());

    for chunk in samples.chunks(batch_size.max(1)) {
        let batch = burn::data::dataloader::batcher::Batcher::batch(&batcher, chunk.to_vec());
        let logits = forward(batch.images);
        let indices: Vec<i64> = logits
            .argmax(1)
            .squeeze::<1>(1)
            .into_data()
            .to_vec()
            .expect("argmax output is contiguous int data");
        for idx in indices {
            predictions.push(
                ConditionClass::from_index(idx as usize).unwrap_or(ConditionClass::Failed),
            );
        }
    }
    predictions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_predictions() {
        let truths = vec![
            ConditionClass::Excellent,
            ConditionClass::Good,
            ConditionClass::Fair,
            ConditionClass::Poor,
            ConditionClass::Failed,
        ];
        let report = evaluate_predictions(&truths, &truths);

        assert_eq!(report.accuracy, 1.0);
        assert_eq!(report.macro_f1, 1.0);
        assert_eq!(report.urgency_accuracy, 1.0);
        assert_eq!(report.expected_cost, 0.0);
        for i in 0..NUM_CONDITION_CLASSES {
            assert_eq!(report.confusion_matrix[i][i], 1);
        }
    }

    #[test]
    fn test_asymmetric_cost() {
        // Truth failed, predicted excellent: the expensive direction
        let costly = evaluate_predictions(
            &[ConditionClass::Failed],
            &[ConditionClass::Excellent],
        );
        // Truth excellent, predicted failed: conservative mistake
        let conservative = evaluate_predictions(
            &[ConditionClass::Excellent],
            &[ConditionClass::Failed],
        );

        assert_eq!(costly.expected_cost, 2000.0);
        assert_eq!(conservative.expected_cost, 1000.0);
        assert!(costly.expected_cost > conservative.expected_cost);
    }

    #[test]
    fn test_urgency_coarser_than_class() {
        // excellent vs good share the low urgency tier
        let report = evaluate_predictions(
            &[ConditionClass::Excellent, ConditionClass::Fair],
            &[ConditionClass::Good, ConditionClass::Poor],
        );
        assert_eq!(report.accuracy, 0.0);
        assert_eq!(report.urgency_accuracy, 0.5);
    }

    #[test]
    fn test_per_class_metrics() {
        let truths = vec![
            ConditionClass::Good,
            ConditionClass::Good,
            ConditionClass::Poor,
        ];
        let preds = vec![
            ConditionClass::Good,
            ConditionClass::Poor,
            ConditionClass::Poor,
        ];
        let report = evaluate_predictions(&truths, &preds);

        let good = &report.per_class[ConditionClass::Good.index()];
        assert_eq!(good.support, 2);
        assert_eq!(good.precision, 1.0);
        assert_eq!(good.recall, 0.5);

        let poor = &report.per_class[ConditionClass::Poor.index()];
        assert_eq!(poor.precision, 0.5);
        assert_eq!(poor.recall, 1.0);
    }

    #[test]
    fn test_report_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");

        let report = evaluate_predictions(
            &[ConditionClass::Fair, ConditionClass::Fair],
            &[ConditionClass::Fair, ConditionClass::Poor],
        );
        report.save(&path).unwrap();
        let loaded = EvaluationReport::load(&path).unwrap();
        assert_eq!(loaded.num_samples, 2);
        assert_eq!(loaded.accuracy, report.accuracy);
    }
}
