//! Training configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{KbfuseError, Result};

/// Hyperparameters and paths for a training run.
///
/// Defaults mirror the reference fine-tuning recipe: small batches, a low
/// learning rate suitable for a pretrained encoder, and a positive-class
/// weight that rebalances the rare-positive label distribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Mini-batch size for the train split.
    pub batch_size: usize,
    /// Mini-batch size for the dev split.
    pub dev_batch_size: usize,
    /// AdamW learning rate.
    pub lr: f64,
    /// Number of passes over the train split.
    pub epochs: usize,
    /// Weight applied to positive examples in the BCE loss.
    pub pos_weight: f64,
    /// Evaluate and checkpoint every this many train batches.
    pub eval_interval: usize,
    /// RNG seed for parameter init and epoch shuffling.
    pub seed: u64,
    /// Width of the externally supplied KB embeddings.
    pub kb_dim: usize,
    /// Directory holding `train.safetensors` / `dev.safetensors`.
    pub data_dir: PathBuf,
    /// Directory holding the pretrained encoder (`config.json` + `model.safetensors`).
    pub encoder_dir: PathBuf,
    /// Directory checkpoints are written into.
    pub checkpoint_dir: PathBuf,
    /// JSONL file the scalar telemetry stream is appended to.
    pub telemetry_path: PathBuf,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            dev_batch_size: 4,
            lr: 5e-6,
            epochs: 30,
            pos_weight: 5.0,
            eval_interval: 500,
            seed: 21,
            kb_dim: 1024,
            data_dir: PathBuf::from("data"),
            encoder_dir: PathBuf::from("pretrained/encoder"),
            checkpoint_dir: PathBuf::from("checkpoint"),
            telemetry_path: PathBuf::from("runs/scalars.jsonl"),
        }
    }
}

impl TrainConfig {
    /// Load a config from a JSON file. Missing fields fall back to defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            KbfuseError::Config(format!("cannot read {}: {e}", path.as_ref().display()))
        })?;
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_recipe() {
        let cfg = TrainConfig::default();
        assert_eq!(cfg.batch_size, 16);
        assert_eq!(cfg.dev_batch_size, 4);
        assert!((cfg.lr - 5e-6).abs() < 1e-12);
        assert_eq!(cfg.epochs, 30);
        assert!((cfg.pos_weight - 5.0).abs() < 1e-12);
        assert_eq!(cfg.eval_interval, 500);
        assert_eq!(cfg.seed, 21);
        assert_eq!(cfg.kb_dim, 1024);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let cfg: TrainConfig = serde_json::from_str(r#"{"epochs": 2, "lr": 0.001}"#).unwrap();
        assert_eq!(cfg.epochs, 2);
        assert!((cfg.lr - 0.001).abs() < 1e-12);
        assert_eq!(cfg.batch_size, 16);
    }
}
