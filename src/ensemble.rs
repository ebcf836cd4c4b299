//! Ensemble combination.
//!
//! An ensemble is a composite over registered model versions, not a
//! model of its own: members stay independently versioned and the
//! ensemble only stores their ids plus a combination rule. Combination
//! runs on host-side probability vectors, after each member has already
//! applied its own softmax.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dataset::ConditionClass;
use crate::error::{PavementError, Result};

/// How member probabilities are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombinationRule {
    /// Arithmetic mean of member probabilities
    Average,
    /// Per-member weights fit on a validation slice
    LearnedMeta,
}

/// Ensemble confidence may exceed the best member's confidence by at
/// most this much. Combining opinions must not manufacture certainty.
pub const CONFIDENCE_CAP_EPSILON: f32 = 1e-3;

/// A combination of registered model versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ensemble {
    /// Member version ids, in combination order
    pub members: Vec<String>,
    pub rule: CombinationRule,
    /// Normalized member weights; present only for `LearnedMeta`
    pub weights: Option<Vec<f32>>,
}

impl Ensemble {
    /// Plain averaging ensemble.
    pub fn average(members: Vec<String>) -> Self {
        Self {
            members,
            rule: CombinationRule::Average,
            weights: None,
        }
    }

    /// Learned-meta ensemble. `weights` must be normalized and match
    /// the member count.
    pub fn learned(members: Vec<String>, weights: Vec<f32>) -> Result<Self> {
        if weights.len() != members.len() {
            return Err(PavementError::Config(format!(
                "{} weights for {} members",
                weights.len(),
                members.len()
            )));
        }
        Ok(Self {
            members,
            rule: CombinationRule::LearnedMeta,
            weights: Some(weights),
        })
    }

    /// Combine per-member probability vectors for one input.
    ///
    /// Output sums to 1 and its maximum never exceeds the best member
    /// confidence plus [`CONFIDENCE_CAP_EPSILON`].
    pub fn combine(&self, member_probs: &[Vec<f32>]) -> Result<Vec<f32>> {
        if member_probs.len() != self.members.len() {
            return Err(PavementError::Config(format!(
                "expected {} member outputs, got {}",
                self.members.len(),
                member_probs.len()
            )));
        }
        let classes = member_probs
            .first()
            .map(|p| p.len())
            .ok_or_else(|| PavementError::Config("ensemble has no members".to_string()))?;

        let weights: Vec<f32> = match (&self.rule, &self.weights) {
            (CombinationRule::Average, _) => {
                vec![1.0 / member_probs.len() as f32; member_probs.len()]
            }
            (CombinationRule::LearnedMeta, Some(w)) => w.clone(),
            (CombinationRule::LearnedMeta, None) => {
                return Err(PavementError::Config(
                    "learned ensemble is missing its weights".to_string(),
                ))
            }
        };

        let mut combined = vec![0.0f32; classes];
        for (probs, weight) in member_probs.iter().zip(&weights) {
            if probs.len() != classes {
                return Err(PavementError::Config(
                    "member probability vectors differ in length".to_string(),
                ));
            }
            for (c, p) in combined.iter_mut().zip(probs) {
                *c += weight * p;
            }
        }

        let sum: f32 = combined.iter().sum();
        if sum > 0.0 {
            for c in combined.iter_mut() {
                *c /= sum;
            }
        }

        // Confidence cap: never more certain than the best member
        let member_max = member_probs
            .iter()
            .flat_map(|p| p.iter().copied())
            .fold(0.0f32, f32::max);
        let cap = (member_max + CONFIDENCE_CAP_EPSILON).min(1.0);

        let (top_idx, top) = combined
            .iter()
            .copied()
            .enumerate()
            .fold((0, 0.0f32), |acc, (i, v)| if v > acc.1 { (i, v) } else { acc });
        if top > cap {
            let excess_scale = (1.0 - cap) / (1.0 - top);
            for (i, c) in combined.iter_mut().enumerate() {
                if i == top_idx {
                    *c = cap;
                } else {
                    *c *= excess_scale;
                }
            }
        }

        Ok(combined)
    }
}

/// Fit learned-meta weights on a validation slice.
///
/// `member_probs[m][n]` is member m's probability vector for validation
/// sample n. Weights are a softmax over a small parameter vector, fit
/// by gradient descent on the negative log likelihood of the combined
/// probabilities.
pub fn fit_meta_weights(
    member_probs: &[Vec<Vec<f32>>],
    truths: &[ConditionClass],
    min_validation: usize,
) -> Result<Vec<f32>> {
    let num_members = member_probs.len();
    if num_members < 2 {
        return Err(PavementError::Config(
            "learned ensemble needs at least two members".to_string(),
        ));
    }
    let n = truths.len();
    if n < min_validation {
        return Err(PavementError::InsufficientValidationData(format!(
            "{} validation samples, need at least {}",
            n, min_validation
        )));
    }
    for probs in member_probs {
        if probs.len() != n {
            return Err(PavementError::Config(
                "member validation outputs differ in length".to_string(),
            ));
        }
    }

    let mut params = vec![0.0f64; num_members];
    let lr = 0.5;
    let iterations = 300;

    for _ in 0..iterations {
        let weights = softmax(&params);

        // dL/d(weight_m) = -(1/N) sum_n q_m[y_n] / p_n[y_n]
        let mut grad_weights = vec![0.0f64; num_members];
        for sample in 0..n {
            let label = truths[sample].index();
            let mut combined = 0.0f64;
            for (m, probs) in member_probs.iter().enumerate() {
                combined += weights[m] * probs[sample][label] as f64;
            }
            let combined = combined.max(1e-9);
            for (m, probs) in member_probs.iter().enumerate() {
                grad_weights[m] -= probs[sample][label] as f64 / combined / n as f64;
            }
        }

        // Chain through the softmax
        for m in 0..num_members {
            let mut grad = 0.0;
            for j in 0..num_members {
                let jacobian = weights[j] * (if j == m { 1.0 } else { 0.0 } - weights[m]);
                grad += grad_weights[j] * jacobian;
            }
            params[m] -= lr * grad;
        }
    }

    let weights: Vec<f32> = softmax(&params).into_iter().map(|w| w as f32).collect();
    info!("Fitted ensemble weights: {:?}", weights);
    Ok(weights)
}

fn softmax(params: &[f64]) -> Vec<f64> {
    let max = params.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = params.iter().map(|p| (p - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn test_average_sums_to_one() {
        let ensemble = Ensemble::average(vec!["v0001".into(), "v0002".into()]);
        let combined = ensemble
            .combine(&[
                vec![0.6, 0.2, 0.1, 0.05, 0.05],
                vec![0.4, 0.3, 0.1, 0.1, 0.1],
            ])
            .unwrap();

        let sum: f32 = combined.iter().sum();
        assert!(approx_eq(sum, 1.0));
        assert!(approx_eq(combined[0], 0.5));
    }

    #[test]
    fn test_confidence_cap() {
        let ensemble = Ensemble::learned(
            vec!["v0001".into(), "v0002".into()],
            vec![0.5, 0.5],
        )
        .unwrap();
        let member_probs = vec![
            vec![0.7, 0.3, 0.0, 0.0, 0.0],
            vec![0.7, 0.0, 0.3, 0.0, 0.0],
        ];
        let combined = ensemble.combine(&member_probs).unwrap();

        let member_max = 0.7f32;
        let top = combined.iter().copied().fold(0.0f32, f32::max);
        assert!(top <= member_max + CONFIDENCE_CAP_EPSILON + 1e-6);
        assert!(approx_eq(combined.iter().sum::<f32>(), 1.0));
    }

    #[test]
    fn test_mismatched_members_rejected() {
        let ensemble = Ensemble::average(vec!["v0001".into(), "v0002".into()]);
        let err = ensemble.combine(&[vec![1.0, 0.0, 0.0, 0.0, 0.0]]).unwrap_err();
        assert!(matches!(err, PavementError::Config(_)));
    }

    #[test]
    fn test_fit_rejects_small_slice() {
        let member_probs = vec![
            vec![vec![0.5f32; 5]; 10],
            vec![vec![0.5f32; 5]; 10],
        ];
        let truths = vec![ConditionClass::Good; 10];
        let err = fit_meta_weights(&member_probs, &truths, 20).unwrap_err();
        assert!(matches!(err, PavementError::InsufficientValidationData(_)));
    }

    #[test]
    fn test_fit_prefers_accurate_member() {
        // Member 0 is always right, member 1 is uniform noise
        let n = 40;
        let truths: Vec<ConditionClass> = (0..n)
            .map(|i| ConditionClass::from_index(i % 5).unwrap())
            .collect();

        let good: Vec<Vec<f32>> = truths
            .iter()
            .map(|t| {
                let mut p = vec![0.05f32; 5];
                p[t.index()] = 0.8;
                p
            })
            .collect();
        let noisy = vec![vec![0.2f32; 5]; n];

        let weights = fit_meta_weights(&[good, noisy], &truths, 20).unwrap();
        assert!(weights[0] > weights[1]);
        assert!(approx_eq(weights.iter().sum::<f32>(), 1.0));
    }

    #[test]
    fn test_learned_weight_count_checked() {
        let err = Ensemble::learned(vec!["v0001".into()], vec![0.5, 0.5]).unwrap_err();
        assert!(matches!(err, PavementError::Config(_)));
    }
}
