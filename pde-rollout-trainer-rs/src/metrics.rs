//! Losses, rollout errors and training history.
//!
//! # Losses
//!
//! [`mse`] is the training criterion: a differentiable scalar tensor.
//!
//! # Rollout errors
//!
//! Evaluation compares an unnormalized rollout with the ground truth by the
//! relative error per sample and channel,
//!
//! ```text
//! ‖pred - target‖_p / ‖target‖_p      (p = 1 or 2, over time and space)
//! ```
//!
//! and aggregates a whole evaluation split to one number by the root mean
//! square ([`rms`]). [`EvalMetrics`] keeps one such number per sub-trajectory
//! for every partition count.
//!
//! # History
//!
//! [`TrainingHistory`] collects per-epoch losses and evaluation metrics and
//! exports them as JSON for the caller to persist.

use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Tensor};
use serde::{Deserialize, Serialize};

/// Smallest denominator of a relative error.
const MIN_NORM: f32 = 1e-12;

/// Mean squared error over all elements.
pub fn mse<B: Backend, const D: usize>(pred: Tensor<B, D>, target: Tensor<B, D>) -> Tensor<B, 1> {
    (pred - target).powf_scalar(2.0).mean()
}

/// Norm of a relative error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorNorm {
    /// Sum of absolute values.
    L1,
    /// Euclidean norm.
    L2,
}

/// Relative error per sample and channel.
///
/// `pred` and `target` are `[batch, time, nodes, channels]`; the norm runs
/// over time and nodes. Returns `[batch, channels]`.
pub fn relative_error<B: Backend>(
    pred: Tensor<B, 4>,
    target: Tensor<B, 4>,
    norm: ErrorNorm,
) -> Tensor<B, 2> {
    let [batch, _, _, channels] = target.dims();
    let reduce = |x: Tensor<B, 4>| x.sum_dim(1).sum_dim(2).reshape([batch, channels]);

    let diff = pred - target.clone();
    let (num, den) = match norm {
        ErrorNorm::L1 => (reduce(diff.abs()), reduce(target.abs())),
        ErrorNorm::L2 => (
            reduce(diff.powf_scalar(2.0)).sqrt(),
            reduce(target.powf_scalar(2.0)).sqrt(),
        ),
    };
    num / den.clamp_min(MIN_NORM)
}

/// Root mean square of all elements.
pub fn rms<B: Backend, const D: usize>(values: Tensor<B, D>) -> f32 {
    values.powf_scalar(2.0).mean().sqrt().into_scalar().elem::<f32>()
}

/// Relative rollout errors per partition count.
///
/// For partition count `p` the time axis is split into `p` equal
/// sub-trajectories; each entry list holds one aggregated error per
/// sub-trajectory, in time order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalMetrics {
    /// Relative L1 errors as `(partitions, errors)`.
    pub error_l1: Vec<(usize, Vec<f32>)>,
    /// Relative L2 errors as `(partitions, errors)`.
    pub error_l2: Vec<(usize, Vec<f32>)>,
}

impl EvalMetrics {
    /// Empty metrics for the given partition counts.
    #[must_use]
    pub fn new(parts: &[usize]) -> Self {
        Self {
            error_l1: parts.iter().map(|&p| (p, Vec::with_capacity(p))).collect(),
            error_l2: parts.iter().map(|&p| (p, Vec::with_capacity(p))).collect(),
        }
    }

    /// Appends the errors of the next sub-trajectory of partition `part`.
    ///
    /// Partitions that were not registered are added on first use.
    pub fn push(&mut self, part: usize, l1: f32, l2: f32) {
        fn entry(list: &mut Vec<(usize, Vec<f32>)>, part: usize) -> &mut Vec<f32> {
            let idx = match list.iter().position(|(p, _)| *p == part) {
                Some(idx) => idx,
                None => {
                    list.push((part, Vec::new()));
                    list.len() - 1
                }
            };
            &mut list[idx].1
        }
        entry(&mut self.error_l1, part).push(l1);
        entry(&mut self.error_l2, part).push(l2);
    }

    /// Errors of partition `part` in the given norm.
    #[must_use]
    pub fn errors(&self, part: usize, norm: ErrorNorm) -> Option<&[f32]> {
        let list = match norm {
            ErrorNorm::L1 => &self.error_l1,
            ErrorNorm::L2 => &self.error_l2,
        };
        list.iter()
            .find(|(p, _)| *p == part)
            .map(|(_, errors)| errors.as_slice())
    }

    /// Error of the first sub-trajectory of partition `part`.
    ///
    /// The first sub-trajectory always starts from ground truth at time
    /// zero, which makes it the headline number of a report.
    #[must_use]
    pub fn first(&self, part: usize, norm: ErrorNorm) -> Option<f32> {
        self.errors(part, norm).and_then(|e| e.first().copied())
    }

    /// One-line report of the first-segment L2 errors in percent.
    #[must_use]
    pub fn summary(&self) -> String {
        self.error_l2
            .iter()
            .filter_map(|(p, errors)| errors.first().map(|e| format!("L2/{p}: {:.2}%", e * 100.0)))
            .collect::<Vec<_>>()
            .join("  ")
    }
}

/// Losses and evaluations of one epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// Epoch number; 0 is the evaluation before training.
    pub epoch: usize,
    /// Mean training loss of the epoch.
    pub loss: f32,
    /// Evaluation on the training split.
    pub train: EvalMetrics,
    /// Evaluation on the validation split, if one was given.
    pub valid: Option<EvalMetrics>,
}

/// Per-epoch history of a training run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    epochs: Vec<EpochRecord>,
}

impl TrainingHistory {
    /// Creates an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an epoch.
    pub fn record(&mut self, record: EpochRecord) {
        self.epochs.push(record);
    }

    /// All recorded epochs in order.
    #[must_use]
    pub fn epochs(&self) -> &[EpochRecord] {
        &self.epochs
    }

    /// The most recent epoch.
    #[must_use]
    pub fn latest(&self) -> Option<&EpochRecord> {
        self.epochs.last()
    }

    /// The trained epoch with the lowest loss.
    #[must_use]
    pub fn best(&self) -> Option<&EpochRecord> {
        self.epochs
            .iter()
            .filter(|r| r.epoch > 0)
            .min_by(|a, b| a.loss.total_cmp(&b.loss))
    }

    /// Exports the history to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Returns a console-friendly summary.
    #[must_use]
    pub fn summary(&self) -> String {
        let Some(latest) = self.latest() else {
            return "Training Summary: no epochs recorded".to_string();
        };
        let best = self.best().map_or(0, |r| r.epoch);
        format!(
            "Training Summary:\n\
             ├─ Epochs: {}\n\
             ├─ Final Loss: {:.4e}\n\
             ├─ Best Epoch: {}\n\
             └─ Final Errors: {}",
            latest.epoch,
            latest.loss,
            best,
            latest.valid.as_ref().unwrap_or(&latest.train).summary(),
        )
    }
}
