//! Error types for the rollout engine and its training scheduler.
//!
//! Every operation in this crate is a deterministic computation over shapes
//! that are known before the first operator call. An error therefore always
//! means misconfiguration or a broken contract, never a transient fault, and
//! there is no recovery or retry machinery: errors are reported immediately
//! and propagated to the caller with `?`.
//!
//! # Error Categories
//!
//! - **Precondition violations**: window bounds, batch divisibility, time-delta
//!   range, shape mismatches at the operator boundary
//! - **Configuration errors**: invalid or inconsistent configuration values
//! - **Operator errors**: failures reported by a [`crate::TransitionOperator`]
//!   implementation, propagated unchanged
//!
//! Numeric failures (NaN or infinity produced by an operator) are not errors
//! here. They flow through the rollout as ordinary values and the caller
//! decides whether to abort training.
//!
//! # Example
//!
//! ```rust
//! use pde_rollout_trainer_rs::error::RolloutError;
//!
//! fn report(error: &RolloutError) {
//!     if error.is_precondition() {
//!         eprintln!("misconfigured run: {error}");
//!     } else {
//!         eprintln!("rollout failed: {error}");
//!     }
//! }
//! ```

use thiserror::Error;

/// The main error type for rollout and training operations.
#[derive(Debug, Error)]
pub enum RolloutError {
    /// A lead-time window would reference a time index outside the trajectory.
    #[error("Window bounds violated: {detail}")]
    WindowBounds {
        /// Description of the violated bound.
        detail: String,
    },

    /// A sample count is not evenly divisible into equal parts.
    #[error("Divisibility violated: {total} {what} cannot be split into parts of {part}")]
    Divisibility {
        /// What is being split (samples, time steps, ...).
        what: &'static str,
        /// The total count.
        total: usize,
        /// The requested part size.
        part: usize,
    },

    /// A time-delta label lies outside `[1, max]`.
    #[error("Time delta {delta} outside the direct-step range [1, {max}]")]
    TimeDeltaRange {
        /// The offending time delta.
        delta: usize,
        /// The number of direct steps `K`.
        max: usize,
    },

    /// A tensor does not have the shape required by a contract.
    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Where the mismatch was detected.
        context: String,
        /// The expected dimensions.
        expected: Vec<usize>,
        /// The observed dimensions.
        actual: Vec<usize>,
    },

    /// Configuration error (invalid parameters or incompatible settings).
    #[error("Configuration error: {detail}")]
    ConfigError {
        /// Description of the configuration issue.
        detail: String,
    },

    /// The transition operator reported a failure.
    #[error("Operator error: {reason}")]
    OperatorError {
        /// Description of the operator failure.
        reason: String,
    },
}

impl RolloutError {
    /// Returns whether this error reports a violated precondition.
    ///
    /// Precondition violations indicate a misconfigured run: rerunning with
    /// the same inputs fails the same way.
    #[must_use]
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::WindowBounds { .. }
                | Self::Divisibility { .. }
                | Self::TimeDeltaRange { .. }
                | Self::ShapeMismatch { .. }
                | Self::ConfigError { .. }
        )
    }

    pub(crate) fn shape(context: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    pub(crate) fn config(detail: impl Into<String>) -> Self {
        Self::ConfigError {
            detail: detail.into(),
        }
    }
}

/// Result alias used throughout the crate.
pub type RolloutResult<T> = Result<T, RolloutError>;
