//! # pde-rollout-trainer-rs
//!
//! Autoregressive rollout engine and push-forward training scheduler for
//! learned PDE transition operators.
//!
//! ## Overview
//!
//! A transition operator advances a discretized PDE state `Δt` time steps in
//! one call. This crate turns such an operator, trained to jump at most `K`
//! steps at once, into an arbitrary-length trajectory predictor, and feeds it
//! aligned training windows cut from full trajectories.
//!
//! The hard parts are the index bookkeeping between raw trajectory steps,
//! direct multi-step jumps and autoregressive compositions of jumps, and the
//! push-forward trick: a randomly sized prefix of the unroll runs outside the
//! autodiff graph so the model sees its own compounding error during training
//! without paying for the backward pass through the whole unroll.
//!
//! ## Data Flow
//!
//! ```text
//!   trajectory [batch, time, nodes, channels]
//!          │
//!          ▼
//!   ┌──────────────────┐
//!   │ LeadTimeWindows  │  (u_lag, u_out, Δt) for every lead time and Δt
//!   └────────┬─────────┘
//!            │  shuffle
//!            ▼
//!   ┌──────────────────┐   noise_steps jumps, detached
//!   │ PushForward      │──────────────────────────────┐
//!   │ Scheduler        │                              ▼
//!   └────────┬─────────┘                       u_noisy (constant)
//!            │  grad_steps jumps + 1 rollout, tracked │
//!            ▼                                        │
//!   ┌──────────────────┐◀─────────────────────────────┘
//!   │ Autoregressive   │
//!   │ Predictor        │──▶ DirectStepComposer ──▶ CheckpointedApply ──▶ operator
//!   └────────┬─────────┘
//!            ▼
//!      MSE against u_out
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use burn::backend::NdArray;
//! use burn::tensor::Tensor;
//! use pde_rollout_trainer_rs::prelude::*;
//!
//! let device = Default::default();
//! let operator = IdentityOperator;
//! let apply = CheckpointedApply::new(&operator);
//! let predictor = AutoregressivePredictor::new(2)?;
//!
//! let specs = Tensor::<NdArray, 2>::zeros([1, 3], &device);
//! let u = Tensor::<NdArray, 4>::ones([1, 1, 16, 1], &device);
//!
//! let rollout = predictor.rollout(&apply, specs, u, 3, Tracking::Detached)?;
//! assert_eq!(rollout.history.dims(), [1, 6, 16, 1]);
//! # Ok::<(), pde_rollout_trainer_rs::RolloutError>(())
//! ```
//!
//! ## Architecture
//!
//! - [`config`] - Training configuration and serialization
//! - [`error`] - Error types
//! - [`gradient_checkpointing`] - Operator call boundary and recompute-on-backward
//! - [`direct`] - Batched direct multi-step prediction
//! - [`autoregressive`] - Full rollouts and cheap jumps
//! - [`push_forward`] - Noise-step sampling, noisy inputs and the training loss
//! - [`windows`] - Lead-time window extraction
//! - [`dataset`] - Trajectory datasets and normalization statistics
//! - [`metrics`] - Losses and relative rollout errors
//! - [`trainer`] - Training and evaluation loops
//! - [`models`] - Reference transition operators

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]
// Allow precision loss casts - acceptable in ML numerical code
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_lines)]

// Core modules
pub mod config;
pub mod error;

// Rollout engine
pub mod autoregressive;
pub mod direct;
pub mod gradient_checkpointing;

// Training scheduler
pub mod dataset;
pub mod metrics;
pub mod push_forward;
pub mod trainer;
pub mod windows;

// Reference operators
pub mod models;

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

pub use autoregressive::{AutoregressivePredictor, Rollout};
pub use config::RolloutTrainerConfig;
pub use dataset::{NormalizationStats, TrajectoryDataset};
pub use direct::DirectStepComposer;
pub use error::{RolloutError, RolloutResult};
pub use gradient_checkpointing::{CheckpointedApply, Checkpointing};
pub use metrics::{EvalMetrics, ErrorNorm};
pub use push_forward::{PushForwardScheduler, PushForwardSplit};
pub use trainer::{RolloutTrainer, TrainingSummary};
pub use windows::{LeadTimeWindows, WindowBatch};

/// A learned map from a state and a time delta to a future state.
///
/// The only capability the rollout engine needs from a model architecture.
/// Implementations must be pure given their parameters: the same inputs give
/// the same output, and nothing is mutated.
///
/// # Shapes
///
/// - `specs`: `[batch, spec_dim]`, per-sample equation parameters
/// - `u_inp`: `[batch, 1, nodes, channels]`
/// - `time_deltas`: `[batch]`, steps ahead per row (integer valued)
/// - output: same shape as `u_inp`
///
/// Parameters live inside the implementing value; for trainable operators
/// that is a burn [`Module`](burn::module::Module).
///
/// # Example
///
/// ```rust
/// use burn::tensor::backend::Backend;
/// use burn::tensor::Tensor;
/// use pde_rollout_trainer_rs::{RolloutResult, TransitionOperator};
///
/// /// Exponential decay `u · (1 - 0.1 Δt)`.
/// struct Decay;
///
/// impl<B: Backend> TransitionOperator<B> for Decay {
///     fn apply(
///         &self,
///         _specs: Tensor<B, 2>,
///         u_inp: Tensor<B, 4>,
///         time_deltas: Tensor<B, 1>,
///     ) -> RolloutResult<Tensor<B, 4>> {
///         let [batch, ..] = u_inp.dims();
///         let factor = time_deltas.mul_scalar(-0.1).add_scalar(1.0);
///         Ok(u_inp * factor.reshape([batch, 1, 1, 1]))
///     }
/// }
/// ```
pub trait TransitionOperator<B: Backend> {
    /// Advances `u_inp` by `time_deltas` steps.
    ///
    /// # Errors
    ///
    /// Implementations report contract violations they detect themselves
    /// (for example a mesh of the wrong size) as
    /// [`RolloutError::OperatorError`].
    fn apply(
        &self,
        specs: Tensor<B, 2>,
        u_inp: Tensor<B, 4>,
        time_deltas: Tensor<B, 1>,
    ) -> RolloutResult<Tensor<B, 4>>;
}

impl<B: Backend, T: TransitionOperator<B> + ?Sized> TransitionOperator<B> for &T {
    fn apply(
        &self,
        specs: Tensor<B, 2>,
        u_inp: Tensor<B, 4>,
        time_deltas: Tensor<B, 1>,
    ) -> RolloutResult<Tensor<B, 4>> {
        (**self).apply(specs, u_inp, time_deltas)
    }
}

/// Gradient tracking mode of an operator call.
///
/// Threaded explicitly through every rollout function rather than toggled on
/// some global state, so one scan never changes mode midway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tracking {
    /// The call participates in the autodiff graph.
    Tracked,
    /// Inputs and outputs are detached; the result is a constant for
    /// differentiation.
    Detached,
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::models::{IdentityOperator, MlpOperator, MlpOperatorConfig};
    pub use crate::{
        AutoregressivePredictor, CheckpointedApply, Checkpointing, DirectStepComposer,
        EvalMetrics, LeadTimeWindows, NormalizationStats, PushForwardScheduler,
        PushForwardSplit, Rollout, RolloutError, RolloutResult, RolloutTrainer,
        RolloutTrainerConfig, Tracking, TrajectoryDataset, TransitionOperator, WindowBatch,
    };
}
