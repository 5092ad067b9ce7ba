//! Autoregressive rollout of a direct-step operator.
//!
//! The scanner turns a fixed-depth operator into an arbitrary-length
//! trajectory predictor by feeding each jump's furthest prediction back as
//! the input of the next jump:
//!
//! ```text
//!   u_inp ──► [Δt = 1..K] ──► block 1 ──last──► [Δt = 1..K] ──► block 2 ── ...
//! ```
//!
//! Two entry points share that loop:
//!
//! - [`AutoregressivePredictor::rollout`] keeps every block and returns the
//!   full chronological history plus the final state
//! - [`AutoregressivePredictor::jump`] makes one `Δt = K` call per jump and
//!   returns the final state only
//!
//! Both are explicit loops with a caller-supplied trip count. Jump `j + 1`
//! always starts from the output of jump `j`.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::direct::DirectStepComposer;
use crate::error::{RolloutError, RolloutResult};
use crate::gradient_checkpointing::CheckpointedApply;
use crate::{TransitionOperator, Tracking};

/// Output of a full rollout.
#[derive(Debug, Clone)]
pub struct Rollout<B: Backend> {
    /// Chronological states `[batch, num_jumps * K, nodes, channels]`.
    ///
    /// The first entry is the supplied input and the last predicted state is
    /// not included (it is `u_final`).
    pub history: Tensor<B, 4>,

    /// State after the last jump, `[batch, 1, nodes, channels]`.
    pub u_final: Tensor<B, 4>,
}

impl<B: Backend> Rollout<B> {
    /// Number of states in the history.
    pub fn len(&self) -> usize {
        self.history.dims()[1]
    }

    /// Whether the history is empty. A rollout always holds at least the input.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// History followed by the final state: `K * num_jumps + 1` entries.
    ///
    /// Entry `i` is the prediction `i` steps after the input.
    pub fn extended(self) -> Tensor<B, 4> {
        Tensor::cat(vec![self.history, self.u_final], 1)
    }
}

/// Composes direct-step jumps into trajectories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoregressivePredictor {
    composer: DirectStepComposer,
}

impl AutoregressivePredictor {
    /// Creates a predictor whose jumps cover `num_steps_direct` steps.
    ///
    /// # Errors
    ///
    /// Returns [`RolloutError::ConfigError`] if `num_steps_direct` is zero.
    pub fn new(num_steps_direct: usize) -> RolloutResult<Self> {
        Ok(Self {
            composer: DirectStepComposer::new(num_steps_direct)?,
        })
    }

    /// The number of direct steps `K` per jump.
    #[must_use]
    pub fn num_steps_direct(&self) -> usize {
        self.composer.num_steps_direct()
    }

    /// The direct-step composer used for each jump.
    #[must_use]
    pub fn composer(&self) -> &DirectStepComposer {
        &self.composer
    }

    /// Number of jumps needed to cover `num_steps` states starting at the input.
    #[must_use]
    pub fn jumps_to_cover(&self, num_steps: usize) -> usize {
        num_steps.div_ceil(self.num_steps_direct()).max(1)
    }

    /// Rolls the operator out for `num_jumps` jumps, keeping every state.
    ///
    /// # Arguments
    ///
    /// * `apply` - Operator call boundary
    /// * `specs` - Equation parameters, `[batch, spec_dim]`
    /// * `u_inp` - Initial state, `[batch, 1, nodes, channels]`
    /// * `num_jumps` - Number of jumps, at least 1
    /// * `tracking` - Gradient tracking mode for every call
    ///
    /// # Errors
    ///
    /// - [`RolloutError::ConfigError`] if `num_jumps` is zero
    /// - errors of the operator calls
    pub fn rollout<B, O>(
        &self,
        apply: &CheckpointedApply<'_, O>,
        specs: Tensor<B, 2>,
        u_inp: Tensor<B, 4>,
        num_jumps: usize,
        tracking: Tracking,
    ) -> RolloutResult<Rollout<B>>
    where
        B: Backend,
        O: TransitionOperator<B> + ?Sized,
    {
        if num_jumps == 0 {
            return Err(RolloutError::config("a rollout needs at least one jump"));
        }

        let deltas = self.composer.time_deltas();
        let k = self.num_steps_direct();
        let mut blocks = Vec::with_capacity(num_jumps);
        let mut current = u_inp.clone();

        for _ in 0..num_jumps {
            let block = self
                .composer
                .direct_steps(apply, specs.clone(), current, &deltas, tracking)?;
            let [batch, _, nodes, channels] = block.dims();
            current = block.clone().slice([0..batch, k - 1..k, 0..nodes, 0..channels]);
            blocks.push(block);
        }

        let total = num_jumps * k;
        let history = if total == 1 {
            u_inp
        } else {
            let predicted = Tensor::cat(blocks, 1);
            let [batch, _, nodes, channels] = predicted.dims();
            Tensor::cat(
                vec![
                    u_inp,
                    predicted.slice([0..batch, 0..total - 1, 0..nodes, 0..channels]),
                ],
                1,
            )
        };

        Ok(Rollout {
            history,
            u_final: current,
        })
    }

    /// Takes `num_jumps` jumps of `K` steps each and returns the final state.
    ///
    /// One operator call per jump with `Δt = K`. Zero jumps return `u_inp`
    /// unchanged.
    ///
    /// # Errors
    ///
    /// Returns errors of the operator calls.
    pub fn jump<B, O>(
        &self,
        apply: &CheckpointedApply<'_, O>,
        specs: Tensor<B, 2>,
        u_inp: Tensor<B, 4>,
        num_jumps: usize,
        tracking: Tracking,
    ) -> RolloutResult<Tensor<B, 4>>
    where
        B: Backend,
        O: TransitionOperator<B> + ?Sized,
    {
        let [batch, ..] = u_inp.dims();
        let device = u_inp.device();
        let step = self.num_steps_direct() as f32;

        let mut current = u_inp;
        for _ in 0..num_jumps {
            let time_deltas = Tensor::<B, 1>::full([batch], step, &device);
            current = apply.apply(specs.clone(), current, time_deltas, tracking)?;
        }

        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IdentityOperator;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray;

    /// `u * (1 + 0.1 Δt)`, a state- and delta-dependent operator.
    struct Growth;

    impl<B: Backend> TransitionOperator<B> for Growth {
        fn apply(
            &self,
            _specs: Tensor<B, 2>,
            u_inp: Tensor<B, 4>,
            time_deltas: Tensor<B, 1>,
        ) -> RolloutResult<Tensor<B, 4>> {
            let [batch, ..] = u_inp.dims();
            let factor = time_deltas.mul_scalar(0.1).add_scalar(1.0).reshape([batch, 1, 1, 1]);
            Ok(u_inp * factor)
        }
    }

    fn input() -> (Tensor<TestBackend, 2>, Tensor<TestBackend, 4>) {
        let device = Default::default();
        let u = Tensor::from_data(
            TensorData::new(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 1, 3, 1]),
            &device,
        );
        (Tensor::zeros([2, 1], &device), u)
    }

    fn values(t: Tensor<TestBackend, 4>) -> Vec<f32> {
        t.into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn test_history_length() {
        for k in 1..=3 {
            let predictor = AutoregressivePredictor::new(k).unwrap();
            let apply = CheckpointedApply::new(&Growth);
            for num_jumps in 1..=3 {
                let (specs, u) = input();
                let rollout = predictor
                    .rollout(&apply, specs, u, num_jumps, Tracking::Detached)
                    .unwrap();
                assert_eq!(rollout.history.dims(), [2, num_jumps * k, 3, 1]);
                assert_eq!(rollout.u_final.dims(), [2, 1, 3, 1]);
            }
        }
    }

    #[test]
    fn test_history_starts_with_input() {
        let predictor = AutoregressivePredictor::new(2).unwrap();
        let apply = CheckpointedApply::new(&Growth);
        let (specs, u) = input();

        let rollout = predictor
            .rollout(&apply, specs, u.clone(), 2, Tracking::Detached)
            .unwrap();
        let first = rollout.history.slice([0..2, 0..1, 0..3, 0..1]);
        assert_eq!(values(first), values(u));
    }

    #[test]
    fn test_blocks_chain_from_last_state() {
        // K = 2, two jumps on a single value 1.0:
        // block 1 = [1.1, 1.2], block 2 = [1.2 * 1.1, 1.2 * 1.2]
        let predictor = AutoregressivePredictor::new(2).unwrap();
        let apply = CheckpointedApply::new(&Growth);
        let device = Default::default();
        let u = Tensor::<TestBackend, 4>::ones([1, 1, 1, 1], &device);
        let specs = Tensor::<TestBackend, 2>::zeros([1, 1], &device);

        let rollout = predictor
            .rollout(&apply, specs, u, 2, Tracking::Detached)
            .unwrap();
        let history = values(rollout.history);
        let expected = [1.0f32, 1.1, 1.2, 1.2 * 1.1];
        for (got, want) in history.iter().zip(expected) {
            assert!((got - want).abs() < 1e-6, "{history:?}");
        }
        let last = values(rollout.u_final)[0];
        assert!((last - 1.2 * 1.2).abs() < 1e-6);
    }

    #[test]
    fn test_jump_matches_rollout_final_state() {
        let predictor = AutoregressivePredictor::new(3).unwrap();
        let apply = CheckpointedApply::new(&Growth);

        let (specs, u) = input();
        let rollout = predictor
            .rollout(&apply, specs.clone(), u.clone(), 4, Tracking::Detached)
            .unwrap();
        let jumped = predictor.jump(&apply, specs, u, 4, Tracking::Detached).unwrap();

        assert_eq!(values(jumped), values(rollout.u_final));
    }

    #[test]
    fn test_jump_call_counts() {
        let predictor = AutoregressivePredictor::new(3).unwrap();
        let apply = CheckpointedApply::new(&Growth);
        let (specs, u) = input();

        predictor.jump(&apply, specs.clone(), u.clone(), 5, Tracking::Detached).unwrap();
        assert_eq!(apply.calls(), 5);

        // One batched call per jump for the full rollout as well.
        predictor.rollout(&apply, specs, u, 2, Tracking::Detached).unwrap();
        assert_eq!(apply.calls(), 7);
    }

    #[test]
    fn test_zero_jumps() {
        let predictor = AutoregressivePredictor::new(2).unwrap();
        let apply = CheckpointedApply::new(&Growth);
        let (specs, u) = input();

        let same = predictor.jump(&apply, specs.clone(), u.clone(), 0, Tracking::Detached).unwrap();
        assert_eq!(values(same), values(u.clone()));
        assert_eq!(apply.calls(), 0);

        assert!(predictor.rollout(&apply, specs, u, 0, Tracking::Detached).is_err());
    }

    #[test]
    fn test_single_step_rollout() {
        let predictor = AutoregressivePredictor::new(1).unwrap();
        let apply = CheckpointedApply::new(&IdentityOperator);
        let (specs, u) = input();

        let rollout = predictor
            .rollout(&apply, specs, u.clone(), 1, Tracking::Detached)
            .unwrap();
        assert_eq!(rollout.len(), 1);
        assert_eq!(values(rollout.history), values(u));
    }

    #[test]
    fn test_extended_indexes_by_delta() {
        let predictor = AutoregressivePredictor::new(2).unwrap();
        let apply = CheckpointedApply::new(&Growth);
        let device = Default::default();
        let u = Tensor::<TestBackend, 4>::ones([1, 1, 1, 1], &device);
        let specs = Tensor::<TestBackend, 2>::zeros([1, 1], &device);

        let extended = predictor
            .rollout(&apply, specs, u, 1, Tracking::Detached)
            .unwrap()
            .extended();
        let got = values(extended);
        assert_eq!(got.len(), 3);
        assert!((got[1] - 1.1).abs() < 1e-6);
        assert!((got[2] - 1.2).abs() < 1e-6);
    }

    #[test]
    fn test_jumps_to_cover() {
        let predictor = AutoregressivePredictor::new(4).unwrap();
        assert_eq!(predictor.jumps_to_cover(16), 4);
        assert_eq!(predictor.jumps_to_cover(17), 5);
        assert_eq!(predictor.jumps_to_cover(1), 1);
    }
}
