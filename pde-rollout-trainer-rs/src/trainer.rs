//! Training and evaluation loops.
//!
//! [`RolloutTrainer`] drives a trainable transition operator through the
//! push-forward scheme:
//!
//! 1. shuffle the training set and split it into equal batches
//! 2. cut every batch into lead-time windows and shuffle the windows
//! 3. draw a push-forward split, build the noisy input without gradients
//! 4. compute the loss on the tracked suffix, backpropagate under the
//!    configured [`Checkpointing`](crate::gradient_checkpointing::Checkpointing) strategy, step the optimizer
//!
//! All randomness (sample shuffles, window shuffles and noise-step draws)
//! comes from one [`ChaCha8Rng`] seeded from the configuration, so a run is
//! reproducible given its seed.
//!
//! Evaluation rolls the model out from the first state of every
//! sub-trajectory and reports relative L1/L2 errors after unnormalizing the
//! prediction (see [`crate::metrics`]).
//!
//! # Example
//!
//! ```rust,no_run
//! use burn::backend::{Autodiff, NdArray};
//! use burn::optim::AdamConfig;
//! use pde_rollout_trainer_rs::prelude::*;
//!
//! type Backend = Autodiff<NdArray>;
//!
//! # fn main() -> RolloutResult<()> {
//! let device = Default::default();
//! let config = RolloutTrainerConfig::builder()
//!     .direct_steps(2)
//!     .unroll_steps(1)
//!     .batch_size(2)
//!     .eval_parts(vec![1, 2])
//!     .build();
//!
//! # let (values, specs) = (vec![0.0; 4 * 8 * 16], vec![0.0; 4]);
//! let train = TrajectoryDataset::<Backend>::from_vec(values, [4, 8, 16, 1], specs, 1, &device)?;
//! let model = MlpOperatorConfig::new(1, 1, 2).init::<Backend>(&device)?;
//! let mut optimizer = AdamConfig::new().init();
//!
//! let mut trainer = RolloutTrainer::new(config)?;
//! let (model, summary) = trainer.fit(model, &mut optimizer, &train, None)?;
//! println!("{}", summary.history.summary());
//! # let _ = model;
//! # Ok(())
//! # }
//! ```

use burn::module::AutodiffModule;
use burn::optim::Optimizer;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use crate::autoregressive::AutoregressivePredictor;
use crate::config::RolloutTrainerConfig;
use crate::dataset::{NormalizationStats, TrajectoryDataset};
use crate::error::{RolloutError, RolloutResult};
use crate::gradient_checkpointing::CheckpointedApply;
use crate::metrics::{relative_error, rms, EpochRecord, ErrorNorm, EvalMetrics, TrainingHistory};
use crate::push_forward::{PushForwardScheduler, PushForwardSplit};
use crate::windows::LeadTimeWindows;
use crate::{TransitionOperator, Tracking};

/// Outcome of one training batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchReport {
    /// Loss of the batch before the optimizer step.
    pub loss: f32,
    /// Push-forward split used for the batch.
    pub split: PushForwardSplit,
    /// Number of windows the batch was cut into.
    pub num_windows: usize,
}

/// Result of [`RolloutTrainer::fit`].
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    /// Per-epoch losses and evaluations; epoch 0 is the untrained model.
    pub history: TrainingHistory,
    /// Optimizer steps taken.
    pub steps: u64,
}

/// Push-forward trainer for transition operators.
#[derive(Debug, Clone)]
pub struct RolloutTrainer {
    config: RolloutTrainerConfig,
    windows: LeadTimeWindows,
    scheduler: PushForwardScheduler,
    rng: ChaCha8Rng,
    step: u64,
}

impl RolloutTrainer {
    /// Creates a trainer.
    ///
    /// # Errors
    ///
    /// Returns [`RolloutError::ConfigError`] if the configuration is invalid.
    pub fn new(config: RolloutTrainerConfig) -> RolloutResult<Self> {
        config.validate()?;

        let windows = LeadTimeWindows::for_unroll(config.direct_steps, config.unroll_steps)?;
        let predictor = AutoregressivePredictor::new(config.direct_steps)?;
        let rng = ChaCha8Rng::seed_from_u64(config.seed);

        Ok(Self {
            config,
            windows,
            scheduler: PushForwardScheduler::new(predictor),
            rng,
            step: 0,
        })
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &RolloutTrainerConfig {
        &self.config
    }

    /// Optimizer steps taken so far.
    #[must_use]
    pub fn step(&self) -> u64 {
        self.step
    }

    /// The predictor used for training and evaluation.
    #[must_use]
    pub fn predictor(&self) -> &AutoregressivePredictor {
        self.scheduler.predictor()
    }

    /// Trains on one batch of normalized trajectories.
    ///
    /// # Arguments
    ///
    /// * `model` - The operator; consumed and returned updated
    /// * `optimizer` - Optimizer for the operator's parameters
    /// * `trajectories` - `[batch, time, nodes, channels]`, normalized
    /// * `specs` - `[batch, spec_dim]`
    ///
    /// # Returns
    ///
    /// The updated model and a report of the batch.
    pub fn train_batch<B, M, O>(
        &mut self,
        model: M,
        optimizer: &mut O,
        trajectories: &Tensor<B, 4>,
        specs: &Tensor<B, 2>,
    ) -> RolloutResult<(M, BatchReport)>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B> + TransitionOperator<B>,
        O: Optimizer<M, B>,
    {
        let windows = self.windows.extract(trajectories, specs)?.shuffle(&mut self.rng);
        let num_windows = windows.len();
        let split =
            PushForwardSplit::sample(&mut self.rng, self.config.unroll_steps, self.config.push_forward);

        debug!(
            step = self.step,
            noise_steps = split.noise_steps,
            grad_steps = split.grad_steps,
            num_windows,
            "push-forward split"
        );

        let (loss_value, grads) = {
            let apply = CheckpointedApply::new(&model);
            let u_inp = self.scheduler.noisy_input(
                &apply,
                windows.specs.clone(),
                windows.u_lag,
                split.noise_steps,
            )?;
            self.scheduler.loss_gradients(
                &model,
                windows.specs,
                u_inp,
                &windows.time_deltas,
                windows.u_out,
                split.grad_steps,
                self.config.checkpointing,
            )?
        };

        let model = optimizer.step(self.config.learning_rate, model, grads);
        self.step += 1;

        Ok((
            model,
            BatchReport {
                loss: loss_value,
                split,
                num_windows,
            },
        ))
    }

    /// Trains one epoch over a normalized dataset.
    ///
    /// Returns the updated model and the sample-weighted mean batch loss.
    ///
    /// # Errors
    ///
    /// Returns [`RolloutError::Divisibility`] if the samples do not split into
    /// equal batches, and any error of [`train_batch`](Self::train_batch).
    pub fn train_epoch<B, M, O>(
        &mut self,
        mut model: M,
        optimizer: &mut O,
        dataset: &TrajectoryDataset<B>,
    ) -> RolloutResult<(M, f32)>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B> + TransitionOperator<B>,
        O: Optimizer<M, B>,
    {
        let batch_size = self.config.batch_size;
        let num_samples = dataset.num_samples();
        let batches = dataset.shuffled_batches(batch_size, &mut self.rng)?;
        let num_batches = batches.len();
        let report_every = (num_batches / 5).max(1);

        let mut loss_epoch = 0.0;
        for (idx, batch) in batches.iter().enumerate() {
            let (updated, report) =
                self.train_batch(model, optimizer, &batch.trajectories, &batch.specs)?;
            model = updated;
            loss_epoch += report.loss * batch_size as f32 / num_samples as f32;

            if self.config.verbose && idx % report_every == 0 {
                info!(
                    batch = idx + 1,
                    num_batches,
                    loss = report.loss,
                    "batch report"
                );
            } else {
                debug!(batch = idx + 1, num_batches, loss = report.loss, "batch done");
            }
        }

        Ok((model, loss_epoch))
    }

    /// Evaluates a model on raw (unnormalized) trajectories.
    ///
    /// For every partition count `p` the time axis is split into `p` equal
    /// sub-trajectories. Each one is predicted from its normalized first
    /// state, unnormalized with the statistics of its time range and
    /// compared to the ground truth.
    ///
    /// # Errors
    ///
    /// - [`RolloutError::Divisibility`] if `p` does not divide the time axis
    /// - [`RolloutError::ConfigError`] if a sub-trajectory is shorter than
    ///   one jump
    /// - [`RolloutError::WindowBounds`] if `stats` cover fewer time steps
    pub fn evaluate<B, M>(
        &self,
        model: &M,
        dataset: &TrajectoryDataset<B>,
        stats: &NormalizationStats<B>,
        parts: &[usize],
    ) -> RolloutResult<EvalMetrics>
    where
        B: Backend,
        M: TransitionOperator<B>,
    {
        let predictor = self.predictor();
        let k = predictor.num_steps_direct();
        let [samples, num_times, nodes, channels] = dataset.trajectories().dims();
        let apply = CheckpointedApply::new(model);
        let mut metrics = EvalMetrics::new(parts);

        for &p in parts {
            if p == 0 || num_times % p != 0 {
                return Err(RolloutError::Divisibility {
                    what: "time steps",
                    total: num_times,
                    part: p,
                });
            }
            let len = num_times / p;
            if len < k {
                return Err(RolloutError::config(format!(
                    "sub-trajectories of {len} steps are shorter than {k} direct steps"
                )));
            }

            for start in (0..num_times).step_by(len) {
                let target = dataset
                    .trajectories()
                    .clone()
                    .slice([0..samples, start..start + len, 0..nodes, 0..channels]);
                let input = target.clone().slice([0..samples, 0..1, 0..nodes, 0..channels]);
                let input = stats.slice_time(start..start + 1)?.normalize(input);

                let rollout = predictor.rollout(
                    &apply,
                    dataset.specs().clone(),
                    input,
                    predictor.jumps_to_cover(len),
                    Tracking::Detached,
                )?;
                let pred = rollout
                    .history
                    .slice([0..samples, 0..len, 0..nodes, 0..channels]);
                let pred = stats.slice_time(start..start + len)?.unnormalize(pred);

                let l1 = rms(relative_error(pred.clone(), target.clone(), ErrorNorm::L1));
                let l2 = rms(relative_error(pred, target, ErrorNorm::L2));
                metrics.push(p, l1, l2);
            }
        }

        Ok(metrics)
    }

    /// Trains for the configured number of epochs.
    ///
    /// Statistics are computed on `train`; training runs on its normalized
    /// copy. The model is evaluated before training and after every epoch on
    /// the training split and, if given, the validation split.
    ///
    /// # Errors
    ///
    /// Returns [`RolloutError`] if the configuration does not fit the data or
    /// any training or evaluation step fails.
    pub fn fit<B, M, O>(
        &mut self,
        mut model: M,
        optimizer: &mut O,
        train: &TrajectoryDataset<B>,
        valid: Option<&TrajectoryDataset<B>>,
    ) -> RolloutResult<(M, TrainingSummary)>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B> + TransitionOperator<B>,
        M::InnerModule: TransitionOperator<B::InnerBackend>,
        O: Optimizer<M, B>,
    {
        self.config
            .validate_for_dataset(train.num_samples(), train.num_times())?;

        let device = train.trajectories().device();
        let stats = NormalizationStats::from_trajectories(train.trajectories());
        let train_nrm = train.normalized(&stats);

        let stats_eval = stats.to_backend::<B::InnerBackend>(&device);
        let train_eval = train.to_backend::<B::InnerBackend>(&device);
        let valid_eval = valid.map(|v| v.to_backend::<B::InnerBackend>(&device));

        let parts = self.config.eval_parts.clone();
        let evaluate_all = |trainer: &Self, model: &M| -> RolloutResult<_> {
            let inner = model.valid();
            let train = trainer.evaluate(&inner, &train_eval, &stats_eval, &parts)?;
            let valid = valid_eval
                .as_ref()
                .map(|v| trainer.evaluate(&inner, v, &stats_eval, &parts))
                .transpose()?;
            Ok((train, valid))
        };

        let mut history = TrainingHistory::new();
        let epochs = self.config.epochs;
        info!(
            num_params = model.num_params(),
            checkpointing = ?self.config.checkpointing,
            "trainable parameters"
        );

        let (train_metrics, valid_metrics) = evaluate_all(self, &model)?;
        info!(
            epoch = 0,
            epochs,
            errors = %valid_metrics.as_ref().unwrap_or(&train_metrics).summary(),
            "initial evaluation"
        );
        history.record(EpochRecord {
            epoch: 0,
            loss: 0.0,
            train: train_metrics,
            valid: valid_metrics,
        });

        for epoch in 1..=epochs {
            let (updated, loss) = self.train_epoch(model, optimizer, &train_nrm)?;
            model = updated;

            let (train_metrics, valid_metrics) = evaluate_all(self, &model)?;
            info!(
                epoch,
                epochs,
                lr = self.config.learning_rate,
                rmse = loss.sqrt(),
                errors = %valid_metrics.as_ref().unwrap_or(&train_metrics).summary(),
                "epoch done"
            );
            history.record(EpochRecord {
                epoch,
                loss,
                train: train_metrics,
                valid: valid_metrics,
            });
        }

        Ok((
            model,
            TrainingSummary {
                history,
                steps: self.step,
            },
        ))
    }
}
