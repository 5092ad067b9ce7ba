//! Stencil MLP transition operator.
//!
//! A small trainable operator for one-dimensional periodic meshes. Every node
//! sees its own state, the states of its two neighbours, the equation
//! parameters and the normalized time delta:
//!
//! ```text
//! features_i = [u_{i-1}, u_i, u_{i+1}, specs, Δt / K]
//! u'_i       = u_i + (Δt / K) · MLP(features_i)
//! ```
//!
//! The update is scaled by `Δt / K`, so a zero time delta is the identity and
//! larger deltas move the state further.

use burn::{
    module::Module,
    nn::{Gelu, Linear, LinearConfig},
    tensor::{backend::Backend, Tensor},
};
use serde::{Deserialize, Serialize};

use crate::error::{RolloutError, RolloutResult};
use crate::TransitionOperator;

/// Configuration of an [`MlpOperator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlpOperatorConfig {
    /// Channels of the state.
    pub num_channels: usize,
    /// Width of the specs vector.
    pub spec_dim: usize,
    /// Hidden layer width.
    pub hidden_size: usize,
    /// Largest time delta the operator is trained for, used to normalize `Δt`.
    pub num_steps_direct: usize,
}

impl MlpOperatorConfig {
    /// Creates a configuration with a hidden width of 32.
    #[must_use]
    pub fn new(num_channels: usize, spec_dim: usize, num_steps_direct: usize) -> Self {
        Self {
            num_channels,
            spec_dim,
            hidden_size: 32,
            num_steps_direct,
        }
    }

    /// Sets the hidden layer width.
    #[must_use]
    pub fn with_hidden_size(mut self, hidden_size: usize) -> Self {
        self.hidden_size = hidden_size;
        self
    }

    /// Width of the per-node feature vector.
    #[must_use]
    pub fn feature_size(&self) -> usize {
        3 * self.num_channels + self.spec_dim + 1
    }

    /// Builds the operator with freshly initialized weights.
    pub fn init<B: Backend>(&self, device: &B::Device) -> RolloutResult<MlpOperator<B>> {
        if self.num_channels == 0 || self.hidden_size == 0 || self.num_steps_direct == 0 {
            return Err(RolloutError::config(
                "num_channels, hidden_size and num_steps_direct must be > 0",
            ));
        }

        Ok(MlpOperator {
            input: LinearConfig::new(self.feature_size(), self.hidden_size).init(device),
            hidden: LinearConfig::new(self.hidden_size, self.hidden_size).init(device),
            output: LinearConfig::new(self.hidden_size, self.num_channels).init(device),
            activation: Gelu::new(),
            num_channels: self.num_channels,
            spec_dim: self.spec_dim,
            num_steps_direct: self.num_steps_direct,
        })
    }
}

/// Per-node MLP over a three-point periodic stencil.
#[derive(Module, Debug)]
pub struct MlpOperator<B: Backend> {
    input: Linear<B>,
    hidden: Linear<B>,
    output: Linear<B>,
    activation: Gelu,
    num_channels: usize,
    spec_dim: usize,
    num_steps_direct: usize,
}

impl<B: Backend> MlpOperator<B> {
    /// Channels of the state this operator expects.
    #[must_use]
    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    /// Width of the specs vector this operator expects.
    #[must_use]
    pub fn spec_dim(&self) -> usize {
        self.spec_dim
    }

    /// Update of shape `[batch, nodes, channels]` before time-delta scaling.
    fn update(&self, features: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = self.activation.forward(self.input.forward(features));
        let x = self.activation.forward(self.hidden.forward(x));
        self.output.forward(x)
    }
}

/// Neighbour values `(u_{i-1}, u_{i+1})` on a periodic mesh.
fn periodic_neighbours<B: Backend>(u: Tensor<B, 3>) -> (Tensor<B, 3>, Tensor<B, 3>) {
    let [batch, nodes, channels] = u.dims();
    if nodes == 1 {
        return (u.clone(), u);
    }

    let last = u.clone().slice([0..batch, nodes - 1..nodes, 0..channels]);
    let first = u.clone().slice([0..batch, 0..1, 0..channels]);
    let left = Tensor::cat(vec![last, u.clone().slice([0..batch, 0..nodes - 1, 0..channels])], 1);
    let right = Tensor::cat(vec![u.slice([0..batch, 1..nodes, 0..channels]), first], 1);
    (left, right)
}

impl<B: Backend> TransitionOperator<B> for MlpOperator<B> {
    fn apply(
        &self,
        specs: Tensor<B, 2>,
        u_inp: Tensor<B, 4>,
        time_deltas: Tensor<B, 1>,
    ) -> RolloutResult<Tensor<B, 4>> {
        let [batch, time, nodes, channels] = u_inp.dims();
        let [_, spec_dim] = specs.dims();
        if time != 1 {
            return Err(RolloutError::OperatorError {
                reason: format!("expected a single input state, got {time}"),
            });
        }
        if channels != self.num_channels || spec_dim != self.spec_dim {
            return Err(RolloutError::OperatorError {
                reason: format!(
                    "expected {} channels and {} specs, got {channels} and {spec_dim}",
                    self.num_channels, self.spec_dim
                ),
            });
        }

        let u = u_inp.reshape([batch, nodes, channels]);
        let (left, right) = periodic_neighbours(u.clone());
        let specs = specs.reshape([batch, 1, spec_dim]).repeat_dim(1, nodes);
        let dt = time_deltas
            .div_scalar(self.num_steps_direct as f32)
            .reshape([batch, 1, 1]);

        let features = Tensor::cat(
            vec![left, u.clone(), right, specs, dt.clone().repeat_dim(1, nodes)],
            2,
        );
        let u_out = u + self.update(features) * dt;

        Ok(u_out.reshape([batch, 1, nodes, channels]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray;

    fn operator() -> MlpOperator<TestBackend> {
        MlpOperatorConfig::new(2, 3, 4)
            .with_hidden_size(8)
            .init(&Default::default())
            .unwrap()
    }

    #[test]
    fn test_preserves_shape() {
        let device = Default::default();
        let out = operator()
            .apply(
                Tensor::zeros([5, 3], &device),
                Tensor::ones([5, 1, 16, 2], &device),
                Tensor::ones([5], &device),
            )
            .unwrap();
        assert_eq!(out.dims(), [5, 1, 16, 2]);
    }

    #[test]
    fn test_zero_delta_is_identity() {
        let device = Default::default();
        let u = Tensor::<TestBackend, 4>::random(
            [2, 1, 6, 2],
            burn::tensor::Distribution::Default,
            &device,
        );
        let out = operator()
            .apply(Tensor::zeros([2, 3], &device), u.clone(), Tensor::zeros([2], &device))
            .unwrap();

        let got = out.into_data().to_vec::<f32>().unwrap();
        let want = u.into_data().to_vec::<f32>().unwrap();
        assert_eq!(got, want);
    }

    #[test]
    fn test_rejects_wrong_channels() {
        let device = Default::default();
        let err = operator()
            .apply(
                Tensor::zeros([1, 3], &device),
                Tensor::ones([1, 1, 4, 5], &device),
                Tensor::ones([1], &device),
            )
            .unwrap_err();
        assert!(matches!(err, RolloutError::OperatorError { .. }));
    }

    #[test]
    fn test_periodic_neighbours() {
        let u = Tensor::<TestBackend, 3>::from_data(
            TensorData::new(vec![1.0f32, 2.0, 3.0], [1, 3, 1]),
            &Default::default(),
        );
        let (left, right) = periodic_neighbours(u);
        assert_eq!(left.into_data().to_vec::<f32>().unwrap(), vec![3.0, 1.0, 2.0]);
        assert_eq!(right.into_data().to_vec::<f32>().unwrap(), vec![2.0, 3.0, 1.0]);
    }

    #[test]
    fn test_rejects_zero_hidden_size() {
        let result = MlpOperatorConfig::new(1, 1, 1)
            .with_hidden_size(0)
            .init::<TestBackend>(&Default::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_num_params() {
        // features 3·2 + 3 + 1 = 10: (10·8 + 8) + (8·8 + 8) + (8·2 + 2)
        assert_eq!(operator().num_params(), 88 + 72 + 18);
    }
}
