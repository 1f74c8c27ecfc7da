//! Batch loading for the token-classification splits.
//!
//! Each split is one safetensors file holding five aligned tensors:
//! `tokens [n, s]`, `attn_mask [n, s]`, `kb_embs [n, s, kb]`,
//! `output_mask [n, s]`, and `labels [n, s]`.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use candle_core::{Device, Tensor};

use crate::error::{KbfuseError, Result};

/// Dataset split names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Dev,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Dev => "dev",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One mini-batch of five aligned tensors.
#[derive(Debug, Clone)]
pub struct Batch {
    pub tokens: Tensor,
    pub attn_mask: Tensor,
    pub kb_embs: Tensor,
    pub output_mask: Tensor,
    pub labels: Tensor,
}

impl Batch {
    /// Blocking host-to-accelerator transfer, once per batch.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            tokens: self.tokens.to_device(device)?,
            attn_mask: self.attn_mask.to_device(device)?,
            kb_embs: self.kb_embs.to_device(device)?,
            output_mask: self.output_mask.to_device(device)?,
            labels: self.labels.to_device(device)?,
        })
    }
}

/// Iterates mini-batches over one split, optionally reshuffling per epoch.
pub struct BatchLoader {
    tokens: Tensor,
    attn_mask: Tensor,
    kb_embs: Tensor,
    output_mask: Tensor,
    labels: Tensor,
    order: Vec<u32>,
    batch_size: usize,
    pos: usize,
}

impl BatchLoader {
    /// Wrap already-loaded split tensors, validating the shared leading dims.
    pub fn from_tensors(
        tokens: Tensor,
        attn_mask: Tensor,
        kb_embs: Tensor,
        output_mask: Tensor,
        labels: Tensor,
        batch_size: usize,
    ) -> Result<Self> {
        let (n, s) = tokens
            .dims2()
            .map_err(|e| KbfuseError::Dataset(format!("tokens must be 2-D: {e}")))?;
        for (name, tensor) in [
            ("attn_mask", &attn_mask),
            ("output_mask", &output_mask),
            ("labels", &labels),
        ] {
            if tensor.dims() != [n, s] {
                return Err(KbfuseError::Dataset(format!(
                    "{name} has shape {:?}, expected [{n}, {s}]",
                    tensor.dims()
                )));
            }
        }
        let kb_dims = kb_embs.dims();
        if kb_dims.len() != 3 || kb_dims[0] != n || kb_dims[1] != s {
            return Err(KbfuseError::Dataset(format!(
                "kb_embs has shape {kb_dims:?}, expected [{n}, {s}, kb_dim]"
            )));
        }
        if batch_size == 0 {
            return Err(KbfuseError::Dataset("batch size must be positive".into()));
        }
        Ok(Self {
            tokens,
            attn_mask,
            kb_embs,
            output_mask,
            labels,
            order: (0..n as u32).collect(),
            batch_size,
            pos: 0,
        })
    }

    /// Number of examples in the split.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Restart iteration in sequential order.
    pub fn reset(&mut self) {
        self.pos = 0;
    }

    /// Restart iteration with a fresh Fisher-Yates shuffle seeded from
    /// `seed + epoch`.
    pub fn reshuffle(&mut self, seed: u64, epoch: usize) {
        let mut rng = oorandom::Rand64::new((seed as u128) << 64 | epoch as u128);
        for i in (1..self.order.len()).rev() {
            let j = rng.rand_range(0..(i as u64 + 1)) as usize;
            self.order.swap(i, j);
        }
        self.pos = 0;
    }

    /// The next mini-batch, or `None` once the split is exhausted.
    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        if self.pos >= self.order.len() {
            return Ok(None);
        }
        let end = (self.pos + self.batch_size).min(self.order.len());
        let index = Tensor::new(&self.order[self.pos..end], self.tokens.device())?;
        self.pos = end;

        Ok(Some(Batch {
            tokens: self.tokens.index_select(&index, 0)?,
            attn_mask: self.attn_mask.index_select(&index, 0)?,
            kb_embs: self.kb_embs.index_select(&index, 0)?,
            output_mask: self.output_mask.index_select(&index, 0)?,
            labels: self.labels.index_select(&index, 0)?,
        }))
    }
}

fn take_tensor(
    tensors: &mut HashMap<String, Tensor>,
    name: &str,
    path: &Path,
) -> Result<Tensor> {
    tensors.remove(name).ok_or_else(|| {
        KbfuseError::Dataset(format!("tensor {name:?} missing from {}", path.display()))
    })
}

/// Open `<data_dir>/<split>.safetensors` and return a batch loader over it.
///
/// Tensors stay on `device`; index-selected batches are cheap views into them.
pub fn make_loader(
    data_dir: &Path,
    split: Split,
    batch_size: usize,
    device: &Device,
) -> Result<BatchLoader> {
    let path = data_dir.join(format!("{split}.safetensors"));
    let mut tensors = candle_core::safetensors::load(&path, device)
        .map_err(|e| KbfuseError::Dataset(format!("cannot load {}: {e}", path.display())))?;

    let tokens = take_tensor(&mut tensors, "tokens", &path)?;
    let attn_mask = take_tensor(&mut tensors, "attn_mask", &path)?;
    let kb_embs = take_tensor(&mut tensors, "kb_embs", &path)?;
    let output_mask = take_tensor(&mut tensors, "output_mask", &path)?;
    let labels = take_tensor(&mut tensors, "labels", &path)?;

    BatchLoader::from_tensors(tokens, attn_mask, kb_embs, output_mask, labels, batch_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn toy_loader(n: usize, batch_size: usize) -> BatchLoader {
        let device = Device::Cpu;
        let tokens = Tensor::zeros((n, 4), DType::U32, &device).unwrap();
        let attn_mask = Tensor::ones((n, 4), DType::U8, &device).unwrap();
        let kb_embs = Tensor::zeros((n, 4, 8), DType::F32, &device).unwrap();
        let output_mask = Tensor::ones((n, 4), DType::U8, &device).unwrap();
        let labels = Tensor::zeros((n, 4), DType::U8, &device).unwrap();
        BatchLoader::from_tensors(tokens, attn_mask, kb_embs, output_mask, labels, batch_size)
            .unwrap()
    }

    #[test]
    fn loader_exhausts_in_ceil_batches() {
        let mut loader = toy_loader(10, 3);
        let mut count = 0;
        let mut examples = 0;
        while let Some(batch) = loader.next_batch().unwrap() {
            count += 1;
            examples += batch.tokens.dim(0).unwrap();
        }
        assert_eq!(count, 4); // ceil(10/3)
        assert_eq!(examples, 10);
    }

    #[test]
    fn batch_tensors_are_aligned() {
        let mut loader = toy_loader(5, 2);
        let batch = loader.next_batch().unwrap().unwrap();
        assert_eq!(batch.tokens.dims(), &[2, 4]);
        assert_eq!(batch.attn_mask.dims(), &[2, 4]);
        assert_eq!(batch.kb_embs.dims(), &[2, 4, 8]);
        assert_eq!(batch.output_mask.dims(), &[2, 4]);
        assert_eq!(batch.labels.dims(), &[2, 4]);
    }

    #[test]
    fn reshuffle_is_seed_deterministic() {
        let mut a = toy_loader(32, 32);
        let mut b = toy_loader(32, 32);
        a.reshuffle(21, 3);
        b.reshuffle(21, 3);
        assert_eq!(a.order, b.order);

        let mut c = toy_loader(32, 32);
        c.reshuffle(21, 4);
        assert_ne!(a.order, c.order);
    }

    #[test]
    fn mismatched_label_shape_is_rejected() {
        let device = Device::Cpu;
        let tokens = Tensor::zeros((4, 6), DType::U32, &device).unwrap();
        let attn_mask = Tensor::ones((4, 6), DType::U8, &device).unwrap();
        let kb_embs = Tensor::zeros((4, 6, 8), DType::F32, &device).unwrap();
        let output_mask = Tensor::ones((4, 6), DType::U8, &device).unwrap();
        let labels = Tensor::zeros((4, 5), DType::U8, &device).unwrap();
        let result =
            BatchLoader::from_tensors(tokens, attn_mask, kb_embs, output_mask, labels, 2);
        assert!(result.is_err());
    }

    #[test]
    fn missing_split_file_propagates_error() {
        let result = make_loader(Path::new("/nonexistent"), Split::Dev, 4, &Device::Cpu);
        assert!(result.is_err());
    }

    #[test]
    fn split_names() {
        assert_eq!(Split::Train.to_string(), "train");
        assert_eq!(Split::Dev.to_string(), "dev");
    }
}
