//! Periodic checkpointing with metric-encoding filenames.
//!
//! Each checkpoint is a safetensors parameter snapshot plus a JSON sidecar
//! with the run state. The filename embeds the hyperparameters and dev
//! metrics so the best checkpoint can be picked post-hoc from a directory
//! listing, without a model registry.

use std::path::{Path, PathBuf};

use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::error::{KbfuseError, Result};

/// Run state written next to the parameter snapshot.
///
/// Optimizer internals are not recorded: candle's `AdamW` exposes no state
/// snapshot, and runs are never resumed mid-stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub epoch: usize,
    pub step: usize,
    pub batch_size: usize,
    pub lr: f64,
    pub pos_weight: f64,
    pub dev_loss: f64,
    pub f1: f64,
}

/// Deterministic checkpoint filename embedding hyperparameters and metrics.
pub fn checkpoint_filename(
    epoch: usize,
    batch_idx: usize,
    batch_size: usize,
    lr: f64,
    pos_weight: f64,
    dev_loss: f64,
    f1: f64,
) -> String {
    format!(
        "kbfuse_batchsize{batch_size}_lr{lr:e}_alpha{pos_weight}_{epoch}_{batch_idx}_{dev_loss:.4}_{f1:.4}.safetensors"
    )
}

/// Persist model parameters and metadata under `dir`.
///
/// The directory is created if missing (an existing one is fine). Returns the
/// path of the written parameter snapshot.
pub fn save_checkpoint(
    dir: &Path,
    varmap: &VarMap,
    batch_idx: usize,
    meta: &CheckpointMeta,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;

    let name = checkpoint_filename(
        meta.epoch,
        batch_idx,
        meta.batch_size,
        meta.lr,
        meta.pos_weight,
        meta.dev_loss,
        meta.f1,
    );
    let weights_path = dir.join(&name);
    varmap
        .save(&weights_path)
        .map_err(|e| KbfuseError::Checkpoint(format!("cannot save {}: {e}", weights_path.display())))?;

    let meta_path = weights_path.with_extension("meta.json");
    std::fs::write(&meta_path, serde_json::to_string_pretty(meta)?)?;

    Ok(weights_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_is_deterministic_and_embeds_values() {
        let name = checkpoint_filename(3, 500, 16, 5e-6, 5.0, 0.23, 0.81);
        assert_eq!(
            name,
            "kbfuse_batchsize16_lr5e-6_alpha5_3_500_0.2300_0.8100.safetensors"
        );
        assert_eq!(name, checkpoint_filename(3, 500, 16, 5e-6, 5.0, 0.23, 0.81));
    }

    #[test]
    fn filename_distinguishes_runs() {
        let a = checkpoint_filename(0, 0, 16, 5e-6, 5.0, 0.5, 0.1);
        let b = checkpoint_filename(0, 500, 16, 5e-6, 5.0, 0.5, 0.1);
        assert_ne!(a, b);
    }

    #[test]
    fn meta_round_trips_through_json() {
        let meta = CheckpointMeta {
            epoch: 2,
            step: 1500,
            batch_size: 16,
            lr: 5e-6,
            pos_weight: 5.0,
            dev_loss: 0.31,
            f1: 0.74,
        };
        let json = serde_json::to_string(&meta).unwrap();
        let back: CheckpointMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back.epoch, 2);
        assert_eq!(back.step, 1500);
        assert!((back.f1 - 0.74).abs() < 1e-12);
    }
}
