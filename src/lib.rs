//! # kbfuse
//!
//! Fine-tunes a pretrained transformer encoder for binary token
//! classification by fusing externally computed knowledge-base embeddings
//! into its input embeddings. Ships the fusion model, a weighted BCE loss
//! with precision/recall/F1 evaluation, and a training loop with periodic
//! dev evaluation and metric-encoding checkpoints.

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod encoder;
pub mod error;
pub mod metrics;
pub mod model;
pub mod telemetry;
pub mod trainer;

// Re-export primary API
pub use checkpoint::{CheckpointMeta, checkpoint_filename, save_checkpoint};
pub use config::TrainConfig;
pub use data::{Batch, BatchLoader, Split, make_loader};
pub use encoder::{Encoder, EncoderConfig, PretrainedEncoder};
pub use error::{KbfuseError, Result};
pub use metrics::{EvalStats, f1_score, weighted_bce_with_logits};
pub use model::FusionModel;
pub use trainer::{DevMetrics, TrainSession};
