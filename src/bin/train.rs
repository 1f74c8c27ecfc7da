use std::path::PathBuf;

use clap::Parser;
use kbfuse::{TrainConfig, TrainSession};

/// Fine-tune the KB-fusion token tagger.
#[derive(Parser, Debug)]
#[command(name = "train", version, about)]
struct Args {
    /// JSON config file; missing fields fall back to defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of training epochs.
    #[arg(long)]
    epochs: Option<usize>,

    /// Train-split mini-batch size.
    #[arg(long)]
    batch_size: Option<usize>,

    /// AdamW learning rate.
    #[arg(long)]
    lr: Option<f64>,

    /// Positive-class weight for the BCE loss.
    #[arg(long)]
    pos_weight: Option<f64>,

    /// Evaluate and checkpoint every N batches.
    #[arg(long)]
    eval_interval: Option<usize>,

    /// Directory with train.safetensors / dev.safetensors.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Directory with the pretrained encoder.
    #[arg(long)]
    encoder_dir: Option<PathBuf>,

    /// Directory checkpoints are written into.
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,
}

fn build_config(args: &Args) -> anyhow::Result<TrainConfig> {
    let mut config = match &args.config {
        Some(path) => TrainConfig::from_file(path)?,
        None => TrainConfig::default(),
    };
    if let Some(epochs) = args.epochs {
        config.epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(lr) = args.lr {
        config.lr = lr;
    }
    if let Some(pos_weight) = args.pos_weight {
        config.pos_weight = pos_weight;
    }
    if let Some(eval_interval) = args.eval_interval {
        config.eval_interval = eval_interval;
    }
    if let Some(data_dir) = &args.data_dir {
        config.data_dir = data_dir.clone();
    }
    if let Some(encoder_dir) = &args.encoder_dir {
        config.encoder_dir = encoder_dir.clone();
    }
    if let Some(checkpoint_dir) = &args.checkpoint_dir {
        config.checkpoint_dir = checkpoint_dir.clone();
    }
    Ok(config)
}

fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = build_config(&args)?;

    let mut session = TrainSession::new(config)?;
    session.run()?;

    println!("DONE");
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Training failed: {e}");
        std::process::exit(1);
    }
}
