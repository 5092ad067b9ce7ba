//! Reference transition operators.
//!
//! The rollout engine only consumes the [`TransitionOperator`] contract; the
//! operators here exist to exercise it. [`IdentityOperator`] never changes
//! the state and pins down the index bookkeeping of rollouts, and
//! [`MlpOperator`] is a small trainable stencil network for end-to-end runs.

pub mod mlp;

pub use mlp::{MlpOperator, MlpOperatorConfig};

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::error::RolloutResult;
use crate::TransitionOperator;

/// Operator that returns its input unchanged for every time delta.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdentityOperator;

impl<B: Backend> TransitionOperator<B> for IdentityOperator {
    fn apply(
        &self,
        _specs: Tensor<B, 2>,
        u_inp: Tensor<B, 4>,
        _time_deltas: Tensor<B, 1>,
    ) -> RolloutResult<Tensor<B, 4>> {
        Ok(u_inp)
    }
}
