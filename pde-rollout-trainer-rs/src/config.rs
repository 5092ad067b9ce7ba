//! Configuration types for rollout training.
//!
//! This module provides the configuration structure and builder for the
//! values the rollout engine and its training scheduler consume: direct-step
//! depth, unroll bound, push-forward switch, backward-pass memory strategy,
//! batch size, epochs, learning rate, seed and evaluation partitions.
//!
//! # Overview
//!
//! The configuration system is designed to be:
//! - **Serializable** - Load/save configurations from TOML files
//! - **Validated** - Invalid configurations are rejected before training
//! - **Defaulted** - Defaults follow the reference training setup
//!
//! Validation happens in two stages. [`RolloutTrainerConfig::validate`]
//! checks values that are wrong regardless of data, while
//! [`RolloutTrainerConfig::validate_for_dataset`] checks the constraints that
//! depend on the number of samples and the trajectory length.
//!
//! # Example
//!
//! ```rust
//! use pde_rollout_trainer_rs::config::RolloutTrainerConfig;
//!
//! // Using defaults
//! let config = RolloutTrainerConfig::default();
//! assert_eq!(config.unroll_offset(), 1);
//!
//! // Using builder pattern
//! let config = RolloutTrainerConfig::builder()
//!     .direct_steps(4)
//!     .unroll_steps(2)
//!     .batch_size(8)
//!     .build();
//! assert_eq!(config.unroll_offset(), 8);
//!
//! // Loading from file
//! // let config = RolloutTrainerConfig::from_file("rollout.toml")?;
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{RolloutError, RolloutResult};
use crate::gradient_checkpointing::Checkpointing;

/// Main configuration for rollout training.
///
/// # Defaults
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `direct_steps` | 1 | Direct steps `K` per jump |
/// | `unroll_steps` | 1 | Jumps between lagged input and target window |
/// | `push_forward` | true | Run a random prefix of the unroll without gradients |
/// | `checkpointing` | recompute | Backward-pass memory strategy |
/// | `batch_size` | 4 | Trajectories per training batch |
/// | `epochs` | 20 | Training epochs |
/// | `learning_rate` | 1e-4 | Optimizer learning rate |
/// | `seed` | 43 | Seed of the shuffling and noise-step stream |
/// | `eval_parts` | [1, 4, 8, 16] | Sub-trajectory partitions for evaluation |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutTrainerConfig {
    /// Number of direct steps `K` the operator jumps at once.
    ///
    /// Time-delta labels range over `1..=K`. Must be at least 1.
    #[serde(default = "default_direct_steps")]
    pub direct_steps: usize,

    /// Number of jumps separating the lagged input from the lead time.
    ///
    /// The lagged input is taken `unroll_steps * direct_steps` time steps
    /// before the lead time. Zero disables unrolling entirely.
    #[serde(default = "default_unroll_steps")]
    pub unroll_steps: usize,

    /// Whether to sample a no-gradient prefix of the unroll per step.
    ///
    /// When disabled every unroll jump is tracked for gradients.
    #[serde(default = "default_push_forward")]
    pub push_forward: bool,

    /// How the tracked suffix is backpropagated.
    ///
    /// `recompute` keeps one operator call's activations at a time.
    #[serde(default)]
    pub checkpointing: Checkpointing,

    /// Number of trajectories per training batch.
    ///
    /// The number of training samples must be divisible by this value.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Number of training epochs.
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Learning rate handed to the optimizer at every step.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// Seed of the single random stream used for shuffling and noise steps.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Partition counts used by evaluation.
    ///
    /// For each entry `p` the time axis is split into `p` sub-trajectories
    /// that are predicted from their first state.
    #[serde(default = "default_eval_parts")]
    pub eval_parts: Vec<usize>,

    /// Whether to report intermediate batch losses during an epoch.
    #[serde(default)]
    pub verbose: bool,
}

// Default value functions for serde
fn default_direct_steps() -> usize {
    1
}
fn default_unroll_steps() -> usize {
    1
}
fn default_push_forward() -> bool {
    true
}
fn default_batch_size() -> usize {
    4
}
fn default_epochs() -> usize {
    20
}
fn default_learning_rate() -> f64 {
    1e-4
}
fn default_seed() -> u64 {
    43
}
fn default_eval_parts() -> Vec<usize> {
    vec![1, 4, 8, 16]
}

impl Default for RolloutTrainerConfig {
    fn default() -> Self {
        Self {
            direct_steps: default_direct_steps(),
            unroll_steps: default_unroll_steps(),
            push_forward: default_push_forward(),
            checkpointing: Checkpointing::default(),
            batch_size: default_batch_size(),
            epochs: default_epochs(),
            learning_rate: default_learning_rate(),
            seed: default_seed(),
            eval_parts: default_eval_parts(),
            verbose: false,
        }
    }
}

impl RolloutTrainerConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> RolloutTrainerConfigBuilder {
        RolloutTrainerConfigBuilder::default()
    }

    /// Number of time steps between the lagged input and the lead time.
    #[must_use]
    pub fn unroll_offset(&self) -> usize {
        self.unroll_steps * self.direct_steps
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> RolloutResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| RolloutError::config(format!("Failed to read config file: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| RolloutError::config(format!("Failed to parse config: {e}")))
    }

    /// Saves configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> RolloutResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| RolloutError::config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| RolloutError::config(format!("Failed to write config file: {e}")))
    }

    /// Validates the data-independent parameters.
    pub fn validate(&self) -> RolloutResult<()> {
        if self.direct_steps == 0 {
            return Err(RolloutError::config("direct_steps must be > 0"));
        }

        if self.batch_size == 0 {
            return Err(RolloutError::config("batch_size must be > 0"));
        }

        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(RolloutError::config("learning_rate must be finite and > 0"));
        }

        if self.eval_parts.is_empty() {
            return Err(RolloutError::config("eval_parts must not be empty"));
        }

        if self.eval_parts.contains(&0) {
            return Err(RolloutError::config("eval_parts entries must be > 0"));
        }

        Ok(())
    }

    /// Validates the configuration against a dataset's dimensions.
    ///
    /// # Arguments
    ///
    /// * `num_samples` - Number of training trajectories
    /// * `num_times` - Length of every trajectory along the time axis
    ///
    /// # Errors
    ///
    /// - [`RolloutError::Divisibility`] if the samples do not split into equal
    ///   batches, or the time axis does not split into an evaluation partition
    /// - [`RolloutError::WindowBounds`] if the unroll offset leaves no lead time
    /// - [`RolloutError::ConfigError`] if an evaluation sub-trajectory is
    ///   shorter than one jump
    pub fn validate_for_dataset(&self, num_samples: usize, num_times: usize) -> RolloutResult<()> {
        self.validate()?;

        if num_samples % self.batch_size != 0 {
            return Err(RolloutError::Divisibility {
                what: "samples",
                total: num_samples,
                part: self.batch_size,
            });
        }

        if num_times <= self.unroll_offset() + self.direct_steps {
            return Err(RolloutError::WindowBounds {
                detail: format!(
                    "unroll offset {} plus {} direct steps leaves no lead time in a trajectory of {num_times} steps",
                    self.unroll_offset(),
                    self.direct_steps
                ),
            });
        }

        for &parts in &self.eval_parts {
            if num_times % parts != 0 {
                return Err(RolloutError::Divisibility {
                    what: "time steps",
                    total: num_times,
                    part: parts,
                });
            }
            if num_times / parts < self.direct_steps {
                return Err(RolloutError::config(format!(
                    "evaluation partition {parts} gives sub-trajectories of {} steps, shorter than direct_steps {}",
                    num_times / parts,
                    self.direct_steps
                )));
            }
        }

        Ok(())
    }
}

/// Builder for `RolloutTrainerConfig`.
#[derive(Debug, Default)]
pub struct RolloutTrainerConfigBuilder {
    direct_steps: Option<usize>,
    unroll_steps: Option<usize>,
    push_forward: Option<bool>,
    checkpointing: Option<Checkpointing>,
    batch_size: Option<usize>,
    epochs: Option<usize>,
    learning_rate: Option<f64>,
    seed: Option<u64>,
    eval_parts: Option<Vec<usize>>,
    verbose: Option<bool>,
}

impl RolloutTrainerConfigBuilder {
    /// Sets the number of direct steps per jump.
    #[must_use]
    pub fn direct_steps(mut self, steps: usize) -> Self {
        self.direct_steps = Some(steps);
        self
    }

    /// Sets the number of unroll jumps.
    #[must_use]
    pub fn unroll_steps(mut self, steps: usize) -> Self {
        self.unroll_steps = Some(steps);
        self
    }

    /// Enables or disables the push-forward prefix.
    #[must_use]
    pub fn push_forward(mut self, enabled: bool) -> Self {
        self.push_forward = Some(enabled);
        self
    }

    /// Sets the backward-pass memory strategy.
    #[must_use]
    pub fn checkpointing(mut self, checkpointing: Checkpointing) -> Self {
        self.checkpointing = Some(checkpointing);
        self
    }

    /// Sets the batch size.
    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Sets the number of epochs.
    #[must_use]
    pub fn epochs(mut self, epochs: usize) -> Self {
        self.epochs = Some(epochs);
        self
    }

    /// Sets the learning rate.
    #[must_use]
    pub fn learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = Some(lr);
        self
    }

    /// Sets the seed.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Sets the evaluation partitions.
    #[must_use]
    pub fn eval_parts(mut self, parts: Vec<usize>) -> Self {
        self.eval_parts = Some(parts);
        self
    }

    /// Sets whether batch losses are reported.
    #[must_use]
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = Some(verbose);
        self
    }

    /// Builds the configuration with defaults for unset values.
    pub fn build(self) -> RolloutTrainerConfig {
        RolloutTrainerConfig {
            direct_steps: self.direct_steps.unwrap_or_else(default_direct_steps),
            unroll_steps: self.unroll_steps.unwrap_or_else(default_unroll_steps),
            push_forward: self.push_forward.unwrap_or_else(default_push_forward),
            checkpointing: self.checkpointing.unwrap_or_default(),
            batch_size: self.batch_size.unwrap_or_else(default_batch_size),
            epochs: self.epochs.unwrap_or_else(default_epochs),
            learning_rate: self.learning_rate.unwrap_or_else(default_learning_rate),
            seed: self.seed.unwrap_or_else(default_seed),
            eval_parts: self.eval_parts.unwrap_or_else(default_eval_parts),
            verbose: self.verbose.unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RolloutTrainerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.unroll_offset(), 1);
    }

    #[test]
    fn test_builder_pattern() {
        let config = RolloutTrainerConfig::builder()
            .direct_steps(2)
            .unroll_steps(3)
            .push_forward(false)
            .seed(7)
            .build();

        assert_eq!(config.direct_steps, 2);
        assert_eq!(config.unroll_steps, 3);
        assert_eq!(config.unroll_offset(), 6);
        assert!(!config.push_forward);
        assert_eq!(config.seed, 7);
        assert_eq!(config.batch_size, 4);
    }

    #[test]
    fn test_serialization_roundtrip() {
        let config = RolloutTrainerConfig::builder().direct_steps(3).build();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: RolloutTrainerConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config, parsed);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: RolloutTrainerConfig = toml::from_str("direct_steps = 2\n").unwrap();
        assert_eq!(parsed.direct_steps, 2);
        assert_eq!(parsed.eval_parts, vec![1, 4, 8, 16]);
        assert!(parsed.push_forward);
        assert_eq!(parsed.checkpointing, Checkpointing::Recompute);
    }

    #[test]
    fn test_checkpointing_from_toml() {
        let parsed: RolloutTrainerConfig = toml::from_str("checkpointing = \"retain\"\n").unwrap();
        assert_eq!(parsed.checkpointing, Checkpointing::Retain);
        assert!(toml::from_str::<RolloutTrainerConfig>("checkpointing = \"lazy\"\n").is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollout.toml");
        let config = RolloutTrainerConfig::builder().epochs(3).verbose(true).build();

        config.to_file(&path).unwrap();
        let loaded = RolloutTrainerConfig::from_file(&path).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_invalid_direct_steps() {
        let config = RolloutTrainerConfig {
            direct_steps: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RolloutError::ConfigError { .. })
        ));
    }

    #[test]
    fn test_dataset_divisibility() {
        let config = RolloutTrainerConfig::builder()
            .batch_size(3)
            .eval_parts(vec![1])
            .build();
        assert!(matches!(
            config.validate_for_dataset(10, 16),
            Err(RolloutError::Divisibility { total: 10, part: 3, .. })
        ));
        assert!(config.validate_for_dataset(9, 16).is_ok());
    }

    #[test]
    fn test_dataset_window_bounds() {
        let config = RolloutTrainerConfig::builder()
            .direct_steps(2)
            .unroll_steps(2)
            .eval_parts(vec![1])
            .build();
        // offset 4 + K 2 needs at least 7 time steps
        assert!(matches!(
            config.validate_for_dataset(4, 6),
            Err(RolloutError::WindowBounds { .. })
        ));
        assert!(config.validate_for_dataset(4, 7).is_ok());
    }

    #[test]
    fn test_eval_partition_checks() {
        let config = RolloutTrainerConfig::builder()
            .direct_steps(4)
            .eval_parts(vec![1, 3])
            .build();
        assert!(matches!(
            config.validate_for_dataset(4, 16),
            Err(RolloutError::Divisibility { what: "time steps", .. })
        ));

        let config = RolloutTrainerConfig::builder()
            .direct_steps(4)
            .eval_parts(vec![8])
            .build();
        assert!(matches!(
            config.validate_for_dataset(4, 16),
            Err(RolloutError::ConfigError { .. })
        ));
    }
}
