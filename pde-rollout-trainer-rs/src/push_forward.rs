//! Push-forward training: noisy inputs and the training loss.
//!
//! During inference the operator is fed its own predictions, so its inputs
//! carry compounding error it never sees when trained on ground truth alone.
//! The push-forward trick closes that gap: each training step unrolls the
//! operator `unroll_steps` jumps from a lagged ground-truth state before
//! comparing against the target window, and cuts the gradient graph at a
//! random depth:
//!
//! ```text
//!   u_lag ──[noise_steps jumps, detached]──▶ u_noisy ──[grad_steps jumps, tracked]──▶ rollout ──▶ loss
//! ```
//!
//! `noise_steps` is drawn uniformly from `{0, ..., unroll_steps}` once per
//! training step and `grad_steps = unroll_steps - noise_steps`. The detached
//! prefix and the tracked suffix are two explicit calls composed by
//! [`PushForwardScheduler`]; the tracking mode never changes within a call.
//!
//! [`PushForwardScheduler::loss_gradients`] backpropagates the tracked suffix
//! under a [`Checkpointing`] strategy. With [`Checkpointing::Recompute`] each
//! of the `grad_steps` jumps and the final rollout is a checkpoint segment
//! that is re-run on the way back.

use burn::module::AutodiffModule;
use burn::optim::{GradientsAccumulator, GradientsParams};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Int, Tensor, TensorData};
use rand::Rng;

use crate::autoregressive::AutoregressivePredictor;
use crate::error::{RolloutError, RolloutResult};
use crate::gradient_checkpointing::{CheckpointedApply, Checkpointing};
use crate::metrics::mse;
use crate::{TransitionOperator, Tracking};

/// Split of the unroll into a detached prefix and a tracked suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PushForwardSplit {
    /// Jumps run without gradient tracking.
    pub noise_steps: usize,
    /// Jumps run with gradient tracking.
    pub grad_steps: usize,
}

impl PushForwardSplit {
    /// Creates a split of `unroll_steps` jumps with `noise_steps` detached ones.
    ///
    /// # Errors
    ///
    /// Returns [`RolloutError::ConfigError`] if `noise_steps > unroll_steps`.
    pub fn new(noise_steps: usize, unroll_steps: usize) -> RolloutResult<Self> {
        if noise_steps > unroll_steps {
            return Err(RolloutError::config(format!(
                "noise_steps ({noise_steps}) exceeds unroll_steps ({unroll_steps})"
            )));
        }
        Ok(Self {
            noise_steps,
            grad_steps: unroll_steps - noise_steps,
        })
    }

    /// Draws a split uniformly from `{0, ..., unroll_steps}` noise steps.
    ///
    /// With push-forward disabled every jump is tracked and the generator is
    /// not advanced.
    pub fn sample<R: Rng + ?Sized>(rng: &mut R, unroll_steps: usize, enabled: bool) -> Self {
        let noise_steps = if enabled {
            rng.random_range(0..=unroll_steps)
        } else {
            0
        };
        Self {
            noise_steps,
            grad_steps: unroll_steps - noise_steps,
        }
    }

    /// Total number of jumps between the lagged input and the target window.
    #[must_use]
    pub fn unroll_steps(&self) -> usize {
        self.noise_steps + self.grad_steps
    }
}

/// Builds noisy inputs and computes the push-forward loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushForwardScheduler {
    predictor: AutoregressivePredictor,
}

impl PushForwardScheduler {
    /// Creates a scheduler around a predictor.
    #[must_use]
    pub fn new(predictor: AutoregressivePredictor) -> Self {
        Self { predictor }
    }

    /// The predictor used for every jump.
    #[must_use]
    pub fn predictor(&self) -> &AutoregressivePredictor {
        &self.predictor
    }

    /// Runs `noise_steps` detached jumps from `u_lag`.
    ///
    /// The result is a constant for differentiation. `noise_steps = 0`
    /// returns `u_lag` itself, untouched.
    pub fn noisy_input<B, O>(
        &self,
        apply: &CheckpointedApply<'_, O>,
        specs: Tensor<B, 2>,
        u_lag: Tensor<B, 4>,
        noise_steps: usize,
    ) -> RolloutResult<Tensor<B, 4>>
    where
        B: Backend,
        O: TransitionOperator<B> + ?Sized,
    {
        if noise_steps == 0 {
            return Ok(u_lag);
        }
        self.predictor
            .jump(apply, specs, u_lag, noise_steps, Tracking::Detached)
    }

    /// Computes the tracked prediction for each window's time delta.
    ///
    /// Jumps `grad_steps` times from `u_inp`, rolls out one more jump and
    /// picks, per row, the state `time_deltas[row]` steps into that jump.
    ///
    /// # Returns
    ///
    /// Predictions of shape `[rows, 1, nodes, channels]`.
    ///
    /// # Errors
    ///
    /// - [`RolloutError::ShapeMismatch`] if `time_deltas` does not have one
    ///   entry per row
    /// - [`RolloutError::TimeDeltaRange`] if a time delta is outside `[1, K]`
    /// - errors of the operator calls
    pub fn predict_windows<B, O>(
        &self,
        apply: &CheckpointedApply<'_, O>,
        specs: Tensor<B, 2>,
        u_inp: Tensor<B, 4>,
        time_deltas: &[usize],
        grad_steps: usize,
    ) -> RolloutResult<Tensor<B, 4>>
    where
        B: Backend,
        O: TransitionOperator<B> + ?Sized,
    {
        let [rows, _, nodes, channels] = u_inp.dims();
        self.check_time_deltas(rows, time_deltas)?;

        let u_inp = self
            .predictor
            .jump(apply, specs.clone(), u_inp, grad_steps, Tracking::Tracked)?;
        let extended = self
            .predictor
            .rollout(apply, specs, u_inp, 1, Tracking::Tracked)?
            .extended();

        let device = extended.device();
        let indices: Vec<i64> = time_deltas
            .iter()
            .flat_map(|&delta| std::iter::repeat(delta as i64).take(nodes * channels))
            .collect();
        let indices = Tensor::<B, 4, Int>::from_data(
            TensorData::new(indices, [rows, 1, nodes, channels]),
            &device,
        );

        Ok(extended.gather(1, indices))
    }

    fn check_time_deltas(&self, rows: usize, time_deltas: &[usize]) -> RolloutResult<()> {
        if time_deltas.len() != rows {
            return Err(RolloutError::shape(
                "window time deltas",
                &[rows],
                &[time_deltas.len()],
            ));
        }
        let composer = self.predictor.composer();
        for &delta in time_deltas {
            composer.check_time_delta(delta)?;
        }
        Ok(())
    }

    /// Mean squared error of [`predict_windows`](Self::predict_windows)
    /// against the target window `u_out` (`[rows, 1, nodes, channels]`).
    ///
    /// The returned scalar is differentiable with respect to the operator's
    /// parameters through the tracked suffix only.
    pub fn compute_loss<B, O>(
        &self,
        apply: &CheckpointedApply<'_, O>,
        specs: Tensor<B, 2>,
        u_inp: Tensor<B, 4>,
        time_deltas: &[usize],
        u_out: Tensor<B, 4>,
        grad_steps: usize,
    ) -> RolloutResult<Tensor<B, 1>>
    where
        B: Backend,
        O: TransitionOperator<B> + ?Sized,
    {
        let expected = u_inp.dims();
        if u_out.dims() != expected {
            return Err(RolloutError::shape("window targets", &expected, &u_out.dims()));
        }
        let pred = self.predict_windows(apply, specs, u_inp, time_deltas, grad_steps)?;
        Ok(mse(pred, u_out))
    }

    /// Loss value and parameter gradients of the tracked suffix.
    ///
    /// Computes [`compute_loss`](Self::compute_loss) and its gradients with
    /// respect to `model`'s parameters. [`Checkpointing::Retain`] backpropagates
    /// one graph spanning all `grad_steps + 1` segments.
    /// [`Checkpointing::Recompute`] runs the segments detached, keeping only
    /// their input states, then walks them in reverse with
    /// [`CheckpointedApply::recompute_backward`] and accumulates the
    /// per-segment gradients.
    ///
    /// # Errors
    ///
    /// Same as [`compute_loss`](Self::compute_loss). Labels and target shape
    /// are checked before the first operator call.
    #[allow(clippy::too_many_arguments)]
    pub fn loss_gradients<B, M>(
        &self,
        model: &M,
        specs: Tensor<B, 2>,
        u_inp: Tensor<B, 4>,
        time_deltas: &[usize],
        u_out: Tensor<B, 4>,
        grad_steps: usize,
        checkpointing: Checkpointing,
    ) -> RolloutResult<(f32, GradientsParams)>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B> + TransitionOperator<B>,
    {
        let dims = u_inp.dims();
        if u_out.dims() != dims {
            return Err(RolloutError::shape("window targets", &dims, &u_out.dims()));
        }
        self.check_time_deltas(dims[0], time_deltas)?;

        let apply = CheckpointedApply::new(model);

        if checkpointing == Checkpointing::Retain {
            let loss =
                self.compute_loss(&apply, specs, u_inp, time_deltas, u_out, grad_steps)?;
            let value = loss.clone().into_scalar().elem::<f32>();
            return Ok((value, GradientsParams::from_grads(loss.backward(), model)));
        }

        let mut checkpoints = Vec::with_capacity(grad_steps);
        let mut current = u_inp.detach();
        for _ in 0..grad_steps {
            let next = self
                .predictor
                .jump(&apply, specs.clone(), current.clone(), 1, Tracking::Detached)?;
            checkpoints.push(current);
            current = next;
        }

        let device = current.device();
        let last = current.require_grad();
        let loss = self.compute_loss(&apply, specs.clone(), last.clone(), time_deltas, u_out, 0)?;
        let value = loss.clone().into_scalar().elem::<f32>();

        let grads = loss.backward();
        let mut grad_out = last
            .grad(&grads)
            .unwrap_or_else(|| Tensor::zeros(dims, &device));
        let mut accumulator = GradientsAccumulator::<M>::new();
        accumulator.accumulate::<B>(model, GradientsParams::from_grads(grads, model));

        let k = self.predictor.num_steps_direct() as f32;
        let step = Tensor::<B, 1>::full([dims[0]], k, &device);
        for checkpoint in checkpoints.into_iter().rev() {
            let (grads, grad_inp) =
                apply.recompute_backward(specs.clone(), checkpoint, step.clone(), grad_out)?;
            accumulator.accumulate::<B>(model, GradientsParams::from_grads(grads, model));
            grad_out = grad_inp;
        }

        tracing::trace!(segments = grad_steps + 1, calls = apply.calls(), "recomputed backward pass");

        Ok((value, accumulator.grads()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IdentityOperator;
    use burn::backend::{Autodiff, NdArray};
    use burn::module::{Module, Param};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    type TestBackend = NdArray;
    type TestAutodiffBackend = Autodiff<NdArray>;

    /// Adds the time delta: `u + Δt`.
    struct Shift;

    impl<B: Backend> TransitionOperator<B> for Shift {
        fn apply(
            &self,
            _specs: Tensor<B, 2>,
            u_inp: Tensor<B, 4>,
            time_deltas: Tensor<B, 1>,
        ) -> RolloutResult<Tensor<B, 4>> {
            let [batch, ..] = u_inp.dims();
            Ok(u_inp + time_deltas.reshape([batch, 1, 1, 1]))
        }
    }

    /// `u · (1 + g · Δt)` with a learnable gain `g`.
    #[derive(Module, Debug)]
    struct Gain<B: Backend> {
        gain: Param<Tensor<B, 1>>,
    }

    impl<B: Backend> Gain<B> {
        fn new(gain: f32, device: &B::Device) -> Self {
            Self {
                gain: Param::from_tensor(Tensor::from_data(TensorData::new(vec![gain], [1]), device)),
            }
        }
    }

    impl<B: Backend> TransitionOperator<B> for Gain<B> {
        fn apply(
            &self,
            _specs: Tensor<B, 2>,
            u_inp: Tensor<B, 4>,
            time_deltas: Tensor<B, 1>,
        ) -> RolloutResult<Tensor<B, 4>> {
            let [batch, ..] = u_inp.dims();
            let factor = (time_deltas * self.gain.val()).add_scalar(1.0);
            Ok(u_inp * factor.reshape([batch, 1, 1, 1]))
        }
    }

    fn gain_gradient(grad_steps: usize, checkpointing: Checkpointing) -> (f32, f32) {
        let device = Default::default();
        let model = Gain::<TestAutodiffBackend>::new(0.05, &device);
        let u = Tensor::<TestAutodiffBackend, 4>::from_data(
            TensorData::new(vec![1.0f32, -0.5, 2.0, 0.25, 1.5, -1.0], [3, 1, 2, 1]),
            &device,
        );
        let target = u.clone().mul_scalar(0.8);

        let (loss, grads) = scheduler(2)
            .loss_gradients(
                &model,
                Tensor::zeros([3, 1], &device),
                u,
                &[1, 2, 2],
                target,
                grad_steps,
                checkpointing,
            )
            .unwrap();
        let grad = grads
            .get::<TestBackend, 1>(model.gain.id)
            .unwrap()
            .into_scalar();
        (loss, grad)
    }

    fn scheduler(k: usize) -> PushForwardScheduler {
        PushForwardScheduler::new(AutoregressivePredictor::new(k).unwrap())
    }

    fn values(t: Tensor<TestBackend, 4>) -> Vec<f32> {
        t.into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn test_split_validation() {
        let split = PushForwardSplit::new(1, 3).unwrap();
        assert_eq!(split.grad_steps, 2);
        assert_eq!(split.unroll_steps(), 3);
        assert!(PushForwardSplit::new(4, 3).is_err());
    }

    #[test]
    fn test_sample_within_bounds_and_reproducible() {
        let mut a = ChaCha8Rng::seed_from_u64(7);
        let mut b = ChaCha8Rng::seed_from_u64(7);
        let mut seen = [false; 4];

        for _ in 0..200 {
            let split = PushForwardSplit::sample(&mut a, 3, true);
            assert_eq!(split, PushForwardSplit::sample(&mut b, 3, true));
            assert_eq!(split.unroll_steps(), 3);
            seen[split.noise_steps] = true;
        }
        assert!(seen.iter().all(|&s| s), "every noise step count should occur");
    }

    #[test]
    fn test_sample_disabled() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        for _ in 0..10 {
            let split = PushForwardSplit::sample(&mut rng, 4, false);
            assert_eq!(split, PushForwardSplit { noise_steps: 0, grad_steps: 4 });
        }
    }

    #[test]
    fn test_noisy_input_zero_steps_is_exact() {
        let device = Default::default();
        let apply = CheckpointedApply::new(&Shift);
        let u = Tensor::<TestBackend, 4>::random(
            [3, 1, 4, 2],
            burn::tensor::Distribution::Default,
            &device,
        );

        let noisy = scheduler(2)
            .noisy_input(&apply, Tensor::zeros([3, 1], &device), u.clone(), 0)
            .unwrap();
        assert_eq!(values(noisy), values(u));
        assert_eq!(apply.calls(), 0);
    }

    #[test]
    fn test_noisy_input_jumps() {
        let device = Default::default();
        let apply = CheckpointedApply::new(&Shift);
        let u = Tensor::<TestBackend, 4>::zeros([1, 1, 1, 1], &device);

        let noisy = scheduler(3)
            .noisy_input(&apply, Tensor::zeros([1, 1], &device), u, 2)
            .unwrap();
        assert_eq!(values(noisy), vec![6.0]);
    }

    #[test]
    fn test_predict_windows_selects_delta_per_row() {
        let device = Default::default();
        let apply = CheckpointedApply::new(&Shift);
        let u = Tensor::<TestBackend, 4>::zeros([3, 1, 2, 1], &device);

        // K = 2, one tracked jump (+2) before the final rollout.
        let pred = scheduler(2)
            .predict_windows(&apply, Tensor::zeros([3, 1], &device), u, &[1, 2, 1], 1)
            .unwrap();
        assert_eq!(pred.dims(), [3, 1, 2, 1]);
        assert_eq!(values(pred), vec![3.0, 3.0, 4.0, 4.0, 3.0, 3.0]);
    }

    #[test]
    fn test_loss_is_zero_for_identity_targets() {
        let device = Default::default();
        let apply = CheckpointedApply::new(&IdentityOperator);
        let u = Tensor::<TestBackend, 4>::ones([4, 1, 3, 1], &device);

        let loss = scheduler(2)
            .compute_loss(
                &apply,
                Tensor::zeros([4, 1], &device),
                u.clone(),
                &[1, 2, 1, 2],
                u,
                2,
            )
            .unwrap();
        assert_eq!(loss.into_scalar(), 0.0);
    }

    #[test]
    fn test_rejects_bad_time_delta_labels() {
        let device = Default::default();
        let apply = CheckpointedApply::new(&IdentityOperator);
        let u = Tensor::<TestBackend, 4>::ones([2, 1, 3, 1], &device);
        let s = scheduler(2);

        let err = s
            .predict_windows(&apply, Tensor::zeros([2, 1], &device), u.clone(), &[1, 3], 0)
            .unwrap_err();
        assert!(matches!(err, RolloutError::TimeDeltaRange { delta: 3, max: 2 }));

        let err = s
            .predict_windows(&apply, Tensor::zeros([2, 1], &device), u, &[1], 0)
            .unwrap_err();
        assert!(matches!(err, RolloutError::ShapeMismatch { .. }));
        assert_eq!(apply.calls(), 0);
    }

    #[test]
    fn test_recomputed_gradients_match_retained() {
        for grad_steps in 0..=3 {
            let (loss_recompute, grad_recompute) = gain_gradient(grad_steps, Checkpointing::Recompute);
            let (loss_retain, grad_retain) = gain_gradient(grad_steps, Checkpointing::Retain);

            assert_eq!(loss_recompute, loss_retain, "grad_steps={grad_steps}");
            assert!(
                (grad_recompute - grad_retain).abs() <= 1e-5 * (1.0 + grad_retain.abs()),
                "grad_steps={grad_steps}: {grad_recompute} != {grad_retain}"
            );
            assert!(grad_retain.abs() > 0.0);
        }
    }

    #[test]
    fn test_loss_gradients_checks_labels_first() {
        let device = Default::default();
        let model = Gain::<TestAutodiffBackend>::new(0.1, &device);
        let u = Tensor::<TestAutodiffBackend, 4>::ones([2, 1, 3, 1], &device);

        let err = scheduler(2)
            .loss_gradients(
                &model,
                Tensor::zeros([2, 1], &device),
                u.clone(),
                &[1, 3],
                u.clone(),
                1,
                Checkpointing::Recompute,
            )
            .unwrap_err();
        assert!(matches!(err, RolloutError::TimeDeltaRange { delta: 3, max: 2 }));

        let err = scheduler(2)
            .loss_gradients(
                &model,
                Tensor::zeros([2, 1], &device),
                u.clone(),
                &[1, 2],
                u.slice([0..1, 0..1, 0..3, 0..1]),
                1,
                Checkpointing::Recompute,
            )
            .unwrap_err();
        assert!(err.to_string().contains("window targets"));
    }
}
