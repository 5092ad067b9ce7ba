//! Trajectory datasets and normalization statistics.
//!
//! A [`TrajectoryDataset`] pairs a trajectory tensor
//! `[samples, time, nodes, channels]` with its per-sample equation
//! parameters `[samples, spec_dim]`. Both are immutable once built; training
//! reads them through seeded shuffles and equal-size batches.
//!
//! [`NormalizationStats`] hold the mean and standard deviation over the
//! sample axis, per time step, node and channel. Training runs on normalized
//! data and evaluation converts rollouts back with
//! [`NormalizationStats::unnormalize`].

use std::ops::Range;

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{RolloutError, RolloutResult};

/// Lower bound applied to standard deviations before dividing.
const MIN_STD: f32 = 1e-8;

/// Trajectories and their equation parameters.
#[derive(Debug, Clone)]
pub struct TrajectoryDataset<B: Backend> {
    trajectories: Tensor<B, 4>,
    specs: Tensor<B, 2>,
}

/// One batch of whole trajectories.
#[derive(Debug, Clone)]
pub struct TrajectoryBatch<B: Backend> {
    /// `[batch, time, nodes, channels]`
    pub trajectories: Tensor<B, 4>,
    /// `[batch, spec_dim]`
    pub specs: Tensor<B, 2>,
}

impl<B: Backend> TrajectoryDataset<B> {
    /// Creates a dataset.
    ///
    /// # Errors
    ///
    /// Returns [`RolloutError::ShapeMismatch`] if specs and trajectories
    /// disagree on the number of samples, and [`RolloutError::ConfigError`]
    /// for an empty dataset.
    pub fn new(trajectories: Tensor<B, 4>, specs: Tensor<B, 2>) -> RolloutResult<Self> {
        let [samples, num_times, ..] = trajectories.dims();
        let [spec_rows, spec_dim] = specs.dims();
        if spec_rows != samples {
            return Err(RolloutError::shape(
                "dataset specs",
                &[samples, spec_dim],
                &specs.dims(),
            ));
        }
        if samples == 0 || num_times == 0 {
            return Err(RolloutError::config("dataset has no samples or no time steps"));
        }
        Ok(Self {
            trajectories,
            specs,
        })
    }

    /// Creates a dataset from host values.
    ///
    /// `shape` is `[samples, time, nodes, channels]`; `specs` holds
    /// `samples * spec_dim` values in row-major order.
    pub fn from_vec(
        trajectories: Vec<f32>,
        shape: [usize; 4],
        specs: Vec<f32>,
        spec_dim: usize,
        device: &B::Device,
    ) -> RolloutResult<Self> {
        let expected: usize = shape.iter().product();
        if trajectories.len() != expected {
            return Err(RolloutError::shape(
                "dataset trajectory values",
                &[expected],
                &[trajectories.len()],
            ));
        }
        if specs.len() != shape[0] * spec_dim {
            return Err(RolloutError::shape(
                "dataset spec values",
                &[shape[0] * spec_dim],
                &[specs.len()],
            ));
        }

        Self::new(
            Tensor::from_data(TensorData::new(trajectories, shape), device),
            Tensor::from_data(TensorData::new(specs, [shape[0], spec_dim]), device),
        )
    }

    /// All trajectories, `[samples, time, nodes, channels]`.
    #[must_use]
    pub fn trajectories(&self) -> &Tensor<B, 4> {
        &self.trajectories
    }

    /// All specs, `[samples, spec_dim]`.
    #[must_use]
    pub fn specs(&self) -> &Tensor<B, 2> {
        &self.specs
    }

    /// Number of samples.
    #[must_use]
    pub fn num_samples(&self) -> usize {
        self.trajectories.dims()[0]
    }

    /// Number of time steps per trajectory.
    #[must_use]
    pub fn num_times(&self) -> usize {
        self.trajectories.dims()[1]
    }

    /// A copy of the dataset with normalized trajectories.
    #[must_use]
    pub fn normalized(&self, stats: &NormalizationStats<B>) -> Self {
        Self {
            trajectories: stats.normalize(self.trajectories.clone()),
            specs: self.specs.clone(),
        }
    }

    /// The dataset moved to another backend.
    ///
    /// Used to bring an autodiff training set down to its inner backend for
    /// evaluation, or the other way round.
    pub fn to_backend<B2: Backend>(&self, device: &B2::Device) -> TrajectoryDataset<B2> {
        TrajectoryDataset {
            trajectories: Tensor::from_data(self.trajectories.to_data(), device),
            specs: Tensor::from_data(self.specs.to_data(), device),
        }
    }

    /// Shuffles samples and splits them into equal batches.
    ///
    /// # Errors
    ///
    /// Returns [`RolloutError::Divisibility`] if the number of samples is not
    /// a multiple of `batch_size`.
    pub fn shuffled_batches<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        rng: &mut R,
    ) -> RolloutResult<Vec<TrajectoryBatch<B>>> {
        let samples = self.num_samples();
        if batch_size == 0 || samples % batch_size != 0 {
            return Err(RolloutError::Divisibility {
                what: "samples",
                total: samples,
                part: batch_size,
            });
        }

        let mut permutation: Vec<i64> = (0..samples as i64).collect();
        permutation.shuffle(rng);

        let device = self.trajectories.device();
        let batches = permutation
            .chunks(batch_size)
            .map(|chunk| {
                let index = Tensor::<B, 1, Int>::from_data(
                    TensorData::new(chunk.to_vec(), [chunk.len()]),
                    &device,
                );
                TrajectoryBatch {
                    trajectories: self.trajectories.clone().select(0, index.clone()),
                    specs: self.specs.clone().select(0, index),
                }
            })
            .collect();

        Ok(batches)
    }
}

/// Mean and standard deviation over the sample axis.
///
/// Both are shaped `[1, time, nodes, channels]` and broadcast over samples.
#[derive(Debug, Clone)]
pub struct NormalizationStats<B: Backend> {
    mean: Tensor<B, 4>,
    std: Tensor<B, 4>,
}

impl<B: Backend> NormalizationStats<B> {
    /// Computes statistics from `[samples, time, nodes, channels]`.
    ///
    /// The standard deviation is the population one, clamped below by a small
    /// constant so constant channels normalize to zero instead of NaN.
    pub fn from_trajectories(trajectories: &Tensor<B, 4>) -> Self {
        let mean = trajectories.clone().mean_dim(0);
        let std = (trajectories.clone() - mean.clone())
            .powf_scalar(2.0)
            .mean_dim(0)
            .sqrt()
            .clamp_min(MIN_STD);
        Self { mean, std }
    }

    /// Mean, `[1, time, nodes, channels]`.
    #[must_use]
    pub fn mean(&self) -> &Tensor<B, 4> {
        &self.mean
    }

    /// Standard deviation, `[1, time, nodes, channels]`.
    #[must_use]
    pub fn std(&self) -> &Tensor<B, 4> {
        &self.std
    }

    /// Statistics restricted to a range of time steps.
    ///
    /// # Errors
    ///
    /// Returns [`RolloutError::WindowBounds`] if the range leaves the time axis.
    pub fn slice_time(&self, range: Range<usize>) -> RolloutResult<Self> {
        let [_, num_times, nodes, channels] = self.mean.dims();
        if range.start >= range.end || range.end > num_times {
            return Err(RolloutError::WindowBounds {
                detail: format!("time range {range:?} outside statistics of {num_times} steps"),
            });
        }
        Ok(Self {
            mean: self
                .mean
                .clone()
                .slice([0..1, range.clone(), 0..nodes, 0..channels]),
            std: self.std.clone().slice([0..1, range, 0..nodes, 0..channels]),
        })
    }

    /// `(x - mean) / std`
    pub fn normalize(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        (x - self.mean.clone()) / self.std.clone()
    }

    /// `x * std + mean`
    pub fn unnormalize(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        x * self.std.clone() + self.mean.clone()
    }

    /// The statistics moved to another backend.
    pub fn to_backend<B2: Backend>(&self, device: &B2::Device) -> NormalizationStats<B2> {
        NormalizationStats {
            mean: Tensor::from_data(self.mean.to_data(), device),
            std: Tensor::from_data(self.std.to_data(), device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    type TestBackend = NdArray;

    fn dataset(samples: usize) -> TrajectoryDataset<TestBackend> {
        let values: Vec<f32> = (0..samples * 3 * 2).map(|v| v as f32).collect();
        let specs: Vec<f32> = (0..samples).map(|s| s as f32).collect();
        TrajectoryDataset::from_vec(values, [samples, 3, 2, 1], specs, 1, &Default::default())
            .unwrap()
    }

    #[test]
    fn test_rejects_mismatched_samples() {
        let device = Default::default();
        let result = TrajectoryDataset::<TestBackend>::new(
            Tensor::zeros([4, 3, 2, 1], &device),
            Tensor::zeros([3, 1], &device),
        );
        assert!(matches!(result, Err(RolloutError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_batches_cover_every_sample_once() {
        let data = dataset(6);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let batches = data.shuffled_batches(2, &mut rng).unwrap();
        assert_eq!(batches.len(), 3);

        let mut seen: Vec<f32> = batches
            .into_iter()
            .flat_map(|b| {
                // Specs identify samples and must stay paired with trajectories.
                let specs = b.specs.into_data().to_vec::<f32>().unwrap();
                let first = b.trajectories.into_data().to_vec::<f32>().unwrap();
                for (i, s) in specs.iter().enumerate() {
                    assert_eq!(first[i * 6], s * 6.0);
                }
                specs
            })
            .collect();
        seen.sort_by(f32::total_cmp);
        assert_eq!(seen, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_batches_reproducible() {
        let data = dataset(8);
        let order = |seed| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            data.shuffled_batches(4, &mut rng)
                .unwrap()
                .into_iter()
                .flat_map(|b| b.specs.into_data().to_vec::<f32>().unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(order(9), order(9));
    }

    #[test]
    fn test_indivisible_batches() {
        let data = dataset(5);
        let err = data
            .shuffled_batches(2, &mut ChaCha8Rng::seed_from_u64(0))
            .unwrap_err();
        assert!(matches!(
            err,
            RolloutError::Divisibility { what: "samples", total: 5, part: 2 }
        ));
    }

    #[test]
    fn test_normalization_roundtrip() {
        let data = dataset(4);
        let stats = NormalizationStats::from_trajectories(data.trajectories());
        assert_eq!(stats.mean().dims(), [1, 3, 2, 1]);

        let normalized = stats.normalize(data.trajectories().clone());
        let mean: f32 = normalized.clone().mean().into_scalar();
        assert!(mean.abs() < 1e-5);

        let restored = stats.unnormalize(normalized).into_data().to_vec::<f32>().unwrap();
        let original = data.trajectories().clone().into_data().to_vec::<f32>().unwrap();
        for (a, b) in restored.iter().zip(&original) {
            assert!((a - b).abs() < 1e-3);
        }
    }

    #[test]
    fn test_constant_channel_normalizes_to_zero() {
        let device = Default::default();
        let constant = Tensor::<TestBackend, 4>::ones([3, 2, 2, 1], &device);
        let stats = NormalizationStats::from_trajectories(&constant);
        let normalized = stats.normalize(constant).into_data().to_vec::<f32>().unwrap();
        assert!(normalized.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_slice_time() {
        let data = dataset(2);
        let stats = NormalizationStats::from_trajectories(data.trajectories());
        assert_eq!(stats.slice_time(1..3).unwrap().std().dims(), [1, 2, 2, 1]);
        assert!(stats.slice_time(2..4).is_err());
        assert!(stats.slice_time(1..1).is_err());
    }
}
