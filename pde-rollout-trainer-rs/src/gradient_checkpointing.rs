//! Checkpointed operator application.
//!
//! Every transition-operator call made by the rollout engine goes through
//! [`CheckpointedApply`]. It is the single call boundary at which the memory
//! strategy for the backward pass is decided, so the scan logic in
//! [`crate::direct`] and [`crate::autoregressive`] never has to know about it.
//!
//! ## Recompute vs. retain
//!
//! A tracked chain of `n` operator calls normally keeps the activations of
//! all `n` calls alive until the backward pass. [`Checkpointing::Recompute`]
//! instead runs the chain detached, keeps only the state entering each call,
//! and rebuilds one call's graph at a time on the way back:
//!
//! ```text
//!   forward:   s_0 ──call──▶ s_1 ──call──▶ ... ──call──▶ s_n ──▶ loss
//!              (detached, only s_0..s_n kept)
//!
//!   backward:  ∂loss/∂s_n ──[recompute call n]──▶ ∂loss/∂s_{n-1} ── ... ──▶ ∂loss/∂s_0
//!              parameter gradients of every call are accumulated
//! ```
//!
//! [`CheckpointedApply::recompute_backward`] is the per-call step of that
//! backward sweep. Peak activation memory is one operator call instead of
//! `n`; the price is a second forward evaluation of every call. Forward
//! values are identical under both strategies and gradients agree up to
//! floating-point summation order.
//!
//! ## Tracking
//!
//! Each call also receives a [`Tracking`] mode. In [`Tracking::Detached`] mode
//! input and output are detached from the autodiff graph, which is how the
//! push-forward prefix runs outside gradient tracking.
//!
//! ## Example
//!
//! ```rust
//! use burn::backend::NdArray;
//! use burn::tensor::Tensor;
//! use pde_rollout_trainer_rs::gradient_checkpointing::CheckpointedApply;
//! use pde_rollout_trainer_rs::models::IdentityOperator;
//! use pde_rollout_trainer_rs::Tracking;
//!
//! let device = Default::default();
//! let operator = IdentityOperator;
//! let apply = CheckpointedApply::new(&operator);
//!
//! let u = Tensor::<NdArray, 4>::ones([2, 1, 8, 1], &device);
//! let specs = Tensor::<NdArray, 2>::zeros([2, 3], &device);
//! let dt = Tensor::<NdArray, 1>::ones([2], &device);
//!
//! let out = apply.apply(specs, u, dt, Tracking::Detached).unwrap();
//! assert_eq!(out.dims(), [2, 1, 8, 1]);
//! assert_eq!(apply.calls(), 1);
//! ```

use std::cell::Cell;

use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{RolloutError, RolloutResult};
use crate::{TransitionOperator, Tracking};

/// Memory strategy for the backward pass of a tracked operator chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checkpointing {
    /// Keep only the state entering each call and recompute the call's
    /// activations during the backward pass.
    #[default]
    Recompute,
    /// Keep the activations of every call until the backward pass.
    Retain,
}

/// Operator wrapper at the single-call boundary.
///
/// Behaviorally identical to the wrapped [`TransitionOperator`]: the numeric
/// result is exactly the operator's. On top of it the wrapper
///
/// - checks the operator contract (singleton time axis, matching batch sizes,
///   output shape equal to input shape),
/// - applies the requested [`Tracking`] mode,
/// - counts invocations.
///
/// Operator failures are propagated unchanged.
pub struct CheckpointedApply<'a, O: ?Sized> {
    operator: &'a O,
    calls: Cell<usize>,
}

impl<'a, O: ?Sized> CheckpointedApply<'a, O> {
    /// Wraps an operator.
    pub fn new(operator: &'a O) -> Self {
        Self {
            operator,
            calls: Cell::new(0),
        }
    }

    /// Number of operator invocations made through this wrapper.
    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    /// Applies the operator to one state.
    ///
    /// # Arguments
    ///
    /// * `specs` - Equation parameters, `[batch, spec_dim]`
    /// * `u_inp` - Input state, `[batch, 1, nodes, channels]`
    /// * `time_deltas` - Time delta per row, `[batch]`
    /// * `tracking` - Whether the call participates in the autodiff graph
    ///
    /// # Errors
    ///
    /// - [`RolloutError::ShapeMismatch`] if inputs or output break the contract
    /// - whatever the operator itself returns
    pub fn apply<B: Backend>(
        &self,
        specs: Tensor<B, 2>,
        u_inp: Tensor<B, 4>,
        time_deltas: Tensor<B, 1>,
        tracking: Tracking,
    ) -> RolloutResult<Tensor<B, 4>>
    where
        O: TransitionOperator<B>,
    {
        let [batch, time, nodes, channels] = u_inp.dims();
        let expected = [batch, 1, nodes, channels];
        if time != 1 {
            return Err(RolloutError::shape(
                "operator input",
                &expected,
                &u_inp.dims(),
            ));
        }

        let [spec_rows, spec_dim] = specs.dims();
        if spec_rows != batch {
            return Err(RolloutError::shape(
                "operator specs",
                &[batch, spec_dim],
                &specs.dims(),
            ));
        }

        let [delta_rows] = time_deltas.dims();
        if delta_rows != batch {
            return Err(RolloutError::shape(
                "operator time deltas",
                &[batch],
                &time_deltas.dims(),
            ));
        }

        let u_inp = match tracking {
            Tracking::Tracked => u_inp,
            Tracking::Detached => u_inp.detach(),
        };

        let u_out = self.operator.apply(specs, u_inp, time_deltas)?;
        self.calls.set(self.calls.get() + 1);

        if u_out.dims() != expected {
            return Err(RolloutError::shape(
                "operator output",
                &expected,
                &u_out.dims(),
            ));
        }

        tracing::trace!(batch, nodes, channels, ?tracking, "transition operator call");

        Ok(match tracking {
            Tracking::Tracked => u_out,
            Tracking::Detached => u_out.detach(),
        })
    }

    /// Backpropagates through one call, recomputed from its saved input.
    ///
    /// Rebuilds the graph of `operator(specs, u_inp, time_deltas)` from a
    /// detached copy of `u_inp` and pulls `grad_out` (the gradient of the
    /// loss with respect to the call's output) back through it.
    ///
    /// # Returns
    ///
    /// The gradients of the operator's parameters for this call and the
    /// gradient with respect to `u_inp`, which is the `grad_out` of the
    /// preceding call.
    ///
    /// # Errors
    ///
    /// - [`RolloutError::ShapeMismatch`] if `grad_out` does not match the
    ///   call's output, or the call breaks the operator contract
    /// - whatever the operator itself returns
    pub fn recompute_backward<B: AutodiffBackend>(
        &self,
        specs: Tensor<B, 2>,
        u_inp: Tensor<B, 4>,
        time_deltas: Tensor<B, 1>,
        grad_out: Tensor<B::InnerBackend, 4>,
    ) -> RolloutResult<(B::Gradients, Tensor<B::InnerBackend, 4>)>
    where
        O: TransitionOperator<B>,
    {
        let dims = u_inp.dims();
        if grad_out.dims() != dims {
            return Err(RolloutError::shape(
                "output gradient",
                &dims,
                &grad_out.dims(),
            ));
        }

        let device = grad_out.device();
        let u_inp = u_inp.detach().require_grad();
        let u_out = self.apply(specs, u_inp.clone(), time_deltas, Tracking::Tracked)?;

        let grads = (u_out * Tensor::<B, 4>::from_inner(grad_out)).sum().backward();
        let grad_inp = u_inp
            .grad(&grads)
            .unwrap_or_else(|| Tensor::zeros(dims, &device));

        Ok((grads, grad_inp))
    }
}
