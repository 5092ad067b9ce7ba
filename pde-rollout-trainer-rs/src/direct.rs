//! Direct multi-step prediction.
//!
//! A direct step asks the operator for the state `Δt` steps ahead of its
//! input without passing through intermediate predicted states, so no
//! single-step error is compounded. [`DirectStepComposer`] produces the
//! outputs for a whole set of time deltas from one input state. It is the
//! atomic "jump unit" of the autoregressive scanner and the source of the
//! predictions compared against training targets.
//!
//! All deltas are evaluated in a single batched operator call: the input
//! state and specs are tiled along the batch axis, one tile per delta, and
//! the output is folded back into a `[batch, K, nodes, channels]` tensor.

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};

use crate::error::{RolloutError, RolloutResult};
use crate::gradient_checkpointing::CheckpointedApply;
use crate::{TransitionOperator, Tracking};

/// Produces direct predictions for time deltas `1..=K`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectStepComposer {
    num_steps_direct: usize,
}

impl DirectStepComposer {
    /// Creates a composer for `num_steps_direct` direct steps.
    ///
    /// # Errors
    ///
    /// Returns [`RolloutError::ConfigError`] if `num_steps_direct` is zero.
    pub fn new(num_steps_direct: usize) -> RolloutResult<Self> {
        if num_steps_direct == 0 {
            return Err(RolloutError::config("num_steps_direct must be > 0"));
        }
        Ok(Self { num_steps_direct })
    }

    /// The number of direct steps `K`.
    #[must_use]
    pub fn num_steps_direct(&self) -> usize {
        self.num_steps_direct
    }

    /// The conventional delta set `1..=K`.
    #[must_use]
    pub fn time_deltas(&self) -> Vec<usize> {
        (1..=self.num_steps_direct).collect()
    }

    /// Checks that a time delta lies in `[1, K]`.
    pub fn check_time_delta(&self, delta: usize) -> RolloutResult<()> {
        if delta == 0 || delta > self.num_steps_direct {
            return Err(RolloutError::TimeDeltaRange {
                delta,
                max: self.num_steps_direct,
            });
        }
        Ok(())
    }

    /// Predicts the states `deltas[i]` steps ahead of `u_inp`.
    ///
    /// Every prediction starts from the same `u_inp`; outputs are never fed
    /// back. The result is ordered to match `deltas`.
    ///
    /// # Arguments
    ///
    /// * `apply` - Operator call boundary
    /// * `specs` - Equation parameters, `[batch, spec_dim]`
    /// * `u_inp` - Input state, `[batch, 1, nodes, channels]`
    /// * `deltas` - Time deltas, each in `[1, K]`
    /// * `tracking` - Gradient tracking mode of the call
    ///
    /// # Returns
    ///
    /// Predictions of shape `[batch, deltas.len(), nodes, channels]`.
    ///
    /// # Errors
    ///
    /// - [`RolloutError::TimeDeltaRange`] if a delta is outside `[1, K]`
    /// - [`RolloutError::ConfigError`] if `deltas` is empty
    /// - errors of the operator call
    pub fn direct_steps<B, O>(
        &self,
        apply: &CheckpointedApply<'_, O>,
        specs: Tensor<B, 2>,
        u_inp: Tensor<B, 4>,
        deltas: &[usize],
        tracking: Tracking,
    ) -> RolloutResult<Tensor<B, 4>>
    where
        B: Backend,
        O: TransitionOperator<B> + ?Sized,
    {
        if deltas.is_empty() {
            return Err(RolloutError::config("direct steps need at least one time delta"));
        }
        for &delta in deltas {
            self.check_time_delta(delta)?;
        }

        let [batch, _, nodes, channels] = u_inp.dims();
        let num_deltas = deltas.len();
        let device = u_inp.device();

        // Tile d holds every batch row for deltas[d].
        let u_tiled = u_inp.repeat_dim(0, num_deltas);
        let specs_tiled = specs.repeat_dim(0, num_deltas);
        let delta_values: Vec<f32> = deltas
            .iter()
            .flat_map(|&delta| std::iter::repeat(delta as f32).take(batch))
            .collect();
        let time_deltas =
            Tensor::<B, 1>::from_data(TensorData::new(delta_values, [num_deltas * batch]), &device);

        let u_out = apply.apply(specs_tiled, u_tiled, time_deltas, tracking)?;

        Ok(u_out
            .reshape([num_deltas, batch, nodes, channels])
            .swap_dims(0, 1))
    }
}
