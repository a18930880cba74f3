//! Fine-tuning trainer
//!
//! Usage: cargo run --bin trainer -- /path/to/config.yaml

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Fine-tune a pretrained diffusion model with eri-finetune")]
struct Args {
    /// Path to the training configuration YAML file
    config: PathBuf,

    /// Override the output directory
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Override the number of optimisation steps
    #[arg(long)]
    max_train_steps: Option<usize>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    eri_finetune::logging::init_logger();

    if !args.config.exists() {
        anyhow::bail!("Config file not found: {}", args.config.display());
    }
    info!("Starting trainer with config: {}", args.config.display());

    let mut config = eri_finetune::load_config(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    if let Some(dir) = args.output_dir {
        info!("Overriding output directory: {}", dir.display());
        config.save.output_dir = dir;
    }
    if let Some(steps) = args.max_train_steps {
        info!("Overriding max_train_steps: {}", steps);
        config.train.max_train_steps = Some(steps);
    }

    let summary = eri_finetune::trainers::train(&config).context("Training failed")?;

    info!(
        "Training completed: {} steps, {} checkpoints",
        summary.global_step,
        summary.checkpoints.len()
    );
    for snapshot in &summary.checkpoints {
        info!("  step {} -> {}", snapshot.step, snapshot.dir.display());
    }
    Ok(())
}
