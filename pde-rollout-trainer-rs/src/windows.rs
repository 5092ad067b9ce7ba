//! Lead-time window extraction.
//!
//! A training batch of full trajectories is cut into aligned
//! `(u_lag, u_out, Δt)` triples, one per valid lead time `t`, sample and time
//! delta:
//!
//! ```text
//!   time ──▶   t-offset          t   t+1 ... t+K
//!                 │              │    └──┬──┘
//!               u_lag        (anchor)  u_out, labelled Δt = 1..K
//! ```
//!
//! `offset = unroll_steps * K` leaves room for the unroll between the lagged
//! input and the anchor. Valid lead times are `offset <= t < num_times - K`,
//! so every referenced index lies in `[0, num_times)`.
//!
//! Everything is flattened along the batch axis in `(lead time, sample, Δt)`
//! order: `num_lead_times * batch * K` rows, each pairing one lagged state
//! with one target state from the same sample.

use std::ops::Range;

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{RolloutError, RolloutResult};

/// Flattened training windows.
#[derive(Debug, Clone)]
pub struct WindowBatch<B: Backend> {
    /// Equation parameters per row, `[rows, spec_dim]`.
    pub specs: Tensor<B, 2>,
    /// Lagged input per row, `[rows, 1, nodes, channels]`.
    pub u_lag: Tensor<B, 4>,
    /// Target state per row, `[rows, 1, nodes, channels]`.
    pub u_out: Tensor<B, 4>,
    /// Steps between the anchor and the target, per row, in `[1, K]`.
    pub time_deltas: Vec<usize>,
}

impl<B: Backend> WindowBatch<B> {
    /// Number of rows.
    pub fn len(&self) -> usize {
        self.time_deltas.len()
    }

    /// Whether the batch holds no rows.
    pub fn is_empty(&self) -> bool {
        self.time_deltas.is_empty()
    }

    /// Permutes all rows with one random permutation.
    ///
    /// Specs, inputs, targets and labels stay aligned.
    #[must_use]
    pub fn shuffle<R: Rng + ?Sized>(self, rng: &mut R) -> Self {
        let mut permutation: Vec<usize> = (0..self.len()).collect();
        permutation.shuffle(rng);

        let device = self.u_lag.device();
        let index = Tensor::<B, 1, Int>::from_data(
            TensorData::new(
                permutation.iter().map(|&i| i as i64).collect::<Vec<_>>(),
                [permutation.len()],
            ),
            &device,
        );

        Self {
            specs: self.specs.select(0, index.clone()),
            u_lag: self.u_lag.select(0, index.clone()),
            u_out: self.u_out.select(0, index),
            time_deltas: permutation.iter().map(|&i| self.time_deltas[i]).collect(),
        }
    }
}

/// Cuts trajectories into lead-time windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeadTimeWindows {
    num_steps_direct: usize,
    offset: usize,
}

impl LeadTimeWindows {
    /// Creates an extractor for `K = num_steps_direct` and a lag of `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`RolloutError::ConfigError`] if `num_steps_direct` is zero.
    pub fn new(num_steps_direct: usize, offset: usize) -> RolloutResult<Self> {
        if num_steps_direct == 0 {
            return Err(RolloutError::config("num_steps_direct must be > 0"));
        }
        Ok(Self {
            num_steps_direct,
            offset,
        })
    }

    /// Creates an extractor lagging the input by `unroll_steps` jumps.
    pub fn for_unroll(num_steps_direct: usize, unroll_steps: usize) -> RolloutResult<Self> {
        Self::new(num_steps_direct, unroll_steps * num_steps_direct)
    }

    /// The number of direct steps `K`.
    #[must_use]
    pub fn num_steps_direct(&self) -> usize {
        self.num_steps_direct
    }

    /// The lag between input and anchor, in time steps.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Valid lead times for a trajectory of `num_times` steps.
    ///
    /// # Errors
    ///
    /// Returns [`RolloutError::WindowBounds`] if no lead time fits.
    pub fn lead_times(&self, num_times: usize) -> RolloutResult<Range<usize>> {
        let end = num_times.saturating_sub(self.num_steps_direct);
        if self.offset >= end {
            return Err(RolloutError::WindowBounds {
                detail: format!(
                    "no lead time fits {num_times} time steps with offset {} and {} direct steps",
                    self.offset, self.num_steps_direct
                ),
            });
        }
        Ok(self.offset..end)
    }

    /// Extracts every window of a batch of trajectories.
    ///
    /// # Arguments
    ///
    /// * `trajectories` - `[batch, time, nodes, channels]`
    /// * `specs` - `[batch, spec_dim]`
    ///
    /// # Errors
    ///
    /// - [`RolloutError::WindowBounds`] if the trajectory is too short
    /// - [`RolloutError::ShapeMismatch`] if specs and trajectories disagree
    ///   on the batch size
    pub fn extract<B: Backend>(
        &self,
        trajectories: &Tensor<B, 4>,
        specs: &Tensor<B, 2>,
    ) -> RolloutResult<WindowBatch<B>> {
        let [batch, num_times, nodes, channels] = trajectories.dims();
        let [spec_rows, spec_dim] = specs.dims();
        if spec_rows != batch {
            return Err(RolloutError::shape(
                "window specs",
                &[batch, spec_dim],
                &specs.dims(),
            ));
        }

        let lead_times = self.lead_times(num_times)?;
        let num_lead_times = lead_times.len();
        let k = self.num_steps_direct;

        let mut lags = Vec::with_capacity(num_lead_times);
        let mut outs = Vec::with_capacity(num_lead_times);
        for t in lead_times {
            let lag = t - self.offset;
            lags.push(
                trajectories
                    .clone()
                    .slice([0..batch, lag..lag + 1, 0..nodes, 0..channels]),
            );
            outs.push(
                trajectories
                    .clone()
                    .slice([0..batch, t + 1..t + 1 + k, 0..nodes, 0..channels]),
            );
        }

        let rows = num_lead_times * batch * k;
        let u_lag = Tensor::cat(lags, 0)
            .repeat_dim(1, k)
            .reshape([rows, 1, nodes, channels]);
        let u_out = Tensor::cat(outs, 0).reshape([rows, 1, nodes, channels]);
        let specs = specs
            .clone()
            .repeat_dim(0, num_lead_times)
            .reshape([num_lead_times * batch, 1, spec_dim])
            .repeat_dim(1, k)
            .reshape([rows, spec_dim]);
        let time_deltas = (0..rows).map(|row| row % k + 1).collect();

        tracing::trace!(num_lead_times, batch, k, rows, "extracted lead-time windows");

        Ok(WindowBatch {
            specs,
            u_lag,
            u_out,
            time_deltas,
        })
    }
}
