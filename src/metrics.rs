//! Weighted BCE loss and precision/recall/F1 accumulation.

use candle_core::{D, DType, Result, Tensor};

/// Numerically stable softplus: `log(1 + exp(x))`.
fn softplus(xs: &Tensor) -> Result<Tensor> {
    let log_term = ((xs.abs()?.neg()?.exp()? + 1.0)?).log()?;
    xs.relu()? + log_term
}

/// Binary cross-entropy with logits, positive class weighted by `pos_weight`.
///
/// `loss = mean(pos_weight * y * softplus(-x) + (1 - y) * softplus(x))`
///
/// Targets must be 0/1 floats of the same shape as the logits.
pub fn weighted_bce_with_logits(logits: &Tensor, targets: &Tensor, pos_weight: f64) -> Result<Tensor> {
    let pos_term = softplus(&logits.neg()?)?; // -log sigmoid(x)
    let neg_term = softplus(logits)?; // -log(1 - sigmoid(x))
    let weighted = ((targets.affine(pos_weight, 0.0)? * pos_term)?
        + (targets.affine(-1.0, 1.0)? * neg_term)?)?;
    weighted.mean_all()
}

/// Keep only the positions flagged by `output_mask`, as a flat 1-D tensor.
///
/// Both tensors share the `[batch, seq]` shape; the mask selects a
/// variable-length subset of positions per batch.
pub fn select_labeled(values: &Tensor, output_mask: &Tensor) -> Result<Tensor> {
    let flat = values.flatten_all()?;
    let mask: Vec<f32> = output_mask
        .flatten_all()?
        .to_dtype(DType::F32)?
        .to_vec1()?;
    let indices: Vec<u32> = mask
        .iter()
        .enumerate()
        .filter(|&(_, &m)| m > 0.5)
        .map(|(i, _)| i as u32)
        .collect();
    let index_tensor = Tensor::new(indices.as_slice(), values.device())?;
    flat.index_select(&index_tensor, 0)
}

/// Running counters for one evaluation pass over the dev split.
#[derive(Debug, Default)]
pub struct EvalStats {
    pub hits: usize,
    pub pred_positive: usize,
    pub truth_positive: usize,
    pub examples: usize,
    pub loss_sum: f64,
    pub batches: usize,
}

impl EvalStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one batch of masked logits and 0/1 float labels into the counters.
    pub fn update(&mut self, logits: &[f32], labels: &[f32], loss: f64) {
        debug_assert_eq!(logits.len(), labels.len());
        for (&logit, &label) in logits.iter().zip(labels.iter()) {
            let pred = logit > 0.0;
            let truth = label > 0.5;
            if pred && truth {
                self.hits += 1;
            }
            if pred {
                self.pred_positive += 1;
            }
            if truth {
                self.truth_positive += 1;
            }
            self.examples += 1;
        }
        self.loss_sum += loss;
        self.batches += 1;
    }

    /// Average dev loss over batches.
    pub fn avg_loss(&self) -> f64 {
        if self.batches == 0 {
            0.0
        } else {
            self.loss_sum / self.batches as f64
        }
    }

    /// hits / predicted positives, 0.0 when nothing was predicted positive.
    pub fn precision(&self) -> f64 {
        if self.pred_positive == 0 {
            0.0
        } else {
            self.hits as f64 / self.pred_positive as f64
        }
    }

    /// hits / ground-truth positives, 0.0 when the split has no positives.
    pub fn recall(&self) -> f64 {
        if self.truth_positive == 0 {
            0.0
        } else {
            self.hits as f64 / self.truth_positive as f64
        }
    }

    /// Harmonic mean of precision and recall, exactly 0.0 when both are 0.
    pub fn f1(&self) -> f64 {
        f1_score(self.precision(), self.recall())
    }
}

/// `2pr / (p + r)`, guarded against the zero denominator.
pub fn f1_score(precision: f64, recall: f64) -> f64 {
    if precision + recall == 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    }
}

/// Binarize labels at 0.5 and turn them into loss targets.
pub fn binarize_labels(labels: &Tensor) -> Result<Tensor> {
    labels.to_dtype(DType::F32)?.gt(0.5)?.to_dtype(DType::F32)
}

/// First `n` values as host floats, for peeking at sample predictions.
pub fn head(values: &Tensor, n: usize) -> Result<Vec<f32>> {
    let flat = values.flatten_all()?;
    let len = flat.dim(D::Minus1)?;
    flat.narrow(0, 0, n.min(len))?.to_vec1()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn zero_predicted_positives_gives_zero_precision() {
        let mut stats = EvalStats::new();
        stats.update(&[-1.0, -2.0, -0.5], &[1.0, 0.0, 1.0], 0.7);
        assert_eq!(stats.pred_positive, 0);
        assert_eq!(stats.precision(), 0.0);
        assert_eq!(stats.f1(), 0.0);
    }

    #[test]
    fn zero_precision_and_recall_give_zero_f1() {
        assert_eq!(f1_score(0.0, 0.0), 0.0);
    }

    #[test]
    fn f1_is_harmonic_mean() {
        assert!((f1_score(1.0, 1.0) - 1.0).abs() < 1e-12);
        assert!((f1_score(0.5, 0.5) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn stats_accumulate_across_batches() {
        let mut stats = EvalStats::new();
        stats.update(&[1.0, -1.0], &[1.0, 1.0], 0.4);
        stats.update(&[2.0, 3.0], &[0.0, 1.0], 0.6);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.pred_positive, 3);
        assert_eq!(stats.truth_positive, 3);
        assert_eq!(stats.examples, 4);
        assert!((stats.avg_loss() - 0.5).abs() < 1e-12);
        assert!((stats.precision() - 2.0 / 3.0).abs() < 1e-12);
        assert!((stats.recall() - 2.0 / 3.0).abs() < 1e-12);
        assert!((stats.f1() - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn bce_at_zero_logit_is_ln_two() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[0.0f32, 0.0], &device).unwrap();
        let targets = Tensor::new(&[1.0f32, 0.0], &device).unwrap();
        let loss = weighted_bce_with_logits(&logits, &targets, 1.0).unwrap();
        let value: f32 = loss.to_scalar().unwrap();
        assert!((value - std::f32::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn pos_weight_scales_positive_term_only() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[0.0f32], &device).unwrap();
        let positive = Tensor::new(&[1.0f32], &device).unwrap();
        let negative = Tensor::new(&[0.0f32], &device).unwrap();

        let weighted: f32 = weighted_bce_with_logits(&logits, &positive, 5.0)
            .unwrap()
            .to_scalar()
            .unwrap();
        let unweighted: f32 = weighted_bce_with_logits(&logits, &negative, 5.0)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!((weighted - 5.0 * std::f32::consts::LN_2).abs() < 1e-4);
        assert!((unweighted - std::f32::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn bce_is_stable_for_large_logits() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[100.0f32, -100.0], &device).unwrap();
        let targets = Tensor::new(&[1.0f32, 0.0], &device).unwrap();
        let loss: f32 = weighted_bce_with_logits(&logits, &targets, 5.0)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(loss.is_finite());
        assert!(loss.abs() < 1e-4);
    }

    #[test]
    fn select_labeled_keeps_flagged_positions() {
        let device = Device::Cpu;
        let values = Tensor::new(&[[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]], &device).unwrap();
        let mask = Tensor::new(&[[1u8, 0, 1], [0, 0, 1]], &device).unwrap();
        let selected: Vec<f32> = select_labeled(&values, &mask).unwrap().to_vec1().unwrap();
        assert_eq!(selected, vec![1.0, 3.0, 6.0]);
    }

    #[test]
    fn select_labeled_with_empty_mask_is_empty() {
        let device = Device::Cpu;
        let values = Tensor::new(&[[1.0f32, 2.0]], &device).unwrap();
        let mask = Tensor::new(&[[0u8, 0]], &device).unwrap();
        let selected = select_labeled(&values, &mask).unwrap();
        assert_eq!(selected.dims(), &[0]);
    }

    #[test]
    fn binarize_thresholds_at_half() {
        let device = Device::Cpu;
        let labels = Tensor::new(&[0.0f32, 0.4, 0.6, 1.0], &device).unwrap();
        let binary: Vec<f32> = binarize_labels(&labels).unwrap().to_vec1().unwrap();
        assert_eq!(binary, vec![0.0, 0.0, 1.0, 1.0]);
    }
}
