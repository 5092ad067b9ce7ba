//! Push-forward training of the stencil MLP on synthetic advection data.
//!
//! Generates travelling sine waves, trains a small operator with two direct
//! steps and one unrolled jump, recomputing operator activations on the
//! backward pass, and prints the evaluation history.
//!
//! # Running
//!
//! ```bash
//! cargo run --example basic_training
//! cargo run --example basic_training -- rollout.toml
//! ```

use burn::backend::{Autodiff, NdArray};
use burn::optim::AdamConfig;
use pde_rollout_trainer_rs::prelude::*;

type Backend = Autodiff<NdArray>;

const SAMPLES: usize = 8;
const TIMES: usize = 16;
const NODES: usize = 32;

/// Advected sine waves `[SAMPLES, TIMES, NODES, 1]` with their wave speeds as specs.
fn advection() -> RolloutResult<TrajectoryDataset<Backend>> {
    let mut values = Vec::with_capacity(SAMPLES * TIMES * NODES);
    let mut specs = Vec::with_capacity(SAMPLES);
    for s in 0..SAMPLES {
        let speed = 0.25 + 0.125 * s as f32;
        specs.push(speed);
        for t in 0..TIMES {
            for n in 0..NODES {
                let phase = (n as f32 - speed * t as f32) / NODES as f32;
                values.push((std::f32::consts::TAU * phase).sin());
            }
        }
    }
    TrajectoryDataset::from_vec(values, [SAMPLES, TIMES, NODES, 1], specs, 1, &Default::default())
}

fn main() -> RolloutResult<()> {
    println!("=== Push-Forward Rollout Training ===\n");

    let config = match std::env::args().nth(1) {
        Some(path) => RolloutTrainerConfig::from_file(path)?,
        None => RolloutTrainerConfig::builder()
            .direct_steps(2)
            .unroll_steps(1)
            .checkpointing(Checkpointing::Recompute)
            .batch_size(4)
            .epochs(10)
            .learning_rate(3e-3)
            .eval_parts(vec![1, 2, 4])
            .build(),
    };
    println!("Configuration:");
    println!("  direct steps:  {}", config.direct_steps);
    println!("  unroll steps:  {}", config.unroll_steps);
    println!("  push-forward:  {}", config.push_forward);
    println!("  checkpointing: {:?}", config.checkpointing);
    println!("  batch size:    {}", config.batch_size);
    println!("  epochs:        {}\n", config.epochs);

    let train = advection()?;
    let model = MlpOperatorConfig::new(1, 1, config.direct_steps)
        .with_hidden_size(32)
        .init::<Backend>(&Default::default())?;
    let mut optimizer = AdamConfig::new().init();

    let mut trainer = RolloutTrainer::new(config)?;
    let (_model, summary) = trainer.fit(model, &mut optimizer, &train, None)?;

    for record in summary.history.epochs() {
        println!(
            "epoch {:>3}  loss {:.3e}  {}",
            record.epoch,
            record.loss,
            record.train.summary()
        );
    }
    println!("\n{}", summary.history.summary());

    Ok(())
}
