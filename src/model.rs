//! Embedding-fusion model: pretrained encoder + KB resize + classification head.
//!
//! KB embeddings are projected to the encoder's hidden width, summed with the
//! token embeddings, and the fused sequence is run through the encoder stack
//! under an extended additive attention mask. Every position is projected to a
//! single logit.

use candle_core::{D, DType, Result, Tensor, bail};
use candle_nn::{Linear, Module, VarBuilder};

use crate::encoder::Encoder;

/// Additive penalty for suppressed attention positions.
const MASK_PENALTY: f64 = -10000.0;

pub struct FusionModel {
    kb_resize: Linear,
    encoder: Box<dyn Encoder>,
    classifier: Linear,
}

impl FusionModel {
    /// Build the resize and classifier heads around an encoder.
    ///
    /// The heads live under `kb_resize` / `classifier` in `vb`; the encoder's
    /// parameters are owned by the encoder itself.
    pub fn new(encoder: Box<dyn Encoder>, kb_dim: usize, vb: VarBuilder) -> Result<Self> {
        let hidden = encoder.hidden_size();
        let kb_resize = candle_nn::linear(kb_dim, hidden, vb.pp("kb_resize"))?;
        let classifier = candle_nn::linear(hidden, 1, vb.pp("classifier"))?;
        Ok(Self {
            kb_resize,
            encoder,
            classifier,
        })
    }

    /// Turn a 0/1 attention mask into an additive bias: 0.0 where attending,
    /// -10000.0 where suppressed.
    ///
    /// A 3-D mask `[batch, query, key]` is taken as-is and broadcast over
    /// heads. A 2-D padding mask `[batch, seq]` is broadcast to
    /// `[batch, 1, 1, seq]`; when the encoder runs as a decoder it is first
    /// combined with a lower-triangular causal mask over the same sequence
    /// length. Any other rank is an error.
    pub fn extended_attention_mask(&self, attn_mask: &Tensor) -> Result<Tensor> {
        let mask = attn_mask.to_dtype(DType::F32)?;
        let broadcast = match mask.dims() {
            [_batch, _query, _key] => mask.unsqueeze(1)?,
            [_batch, seq_len] => {
                let padding = mask.unsqueeze(1)?.unsqueeze(1)?;
                if self.encoder.is_causal() {
                    let causal = Tensor::tril2(*seq_len, DType::F32, attn_mask.device())?
                        .unsqueeze(0)?
                        .unsqueeze(0)?;
                    causal.broadcast_mul(&padding)?
                } else {
                    padding
                }
            }
            dims => bail!(
                "attention mask must be 2-D or 3-D, got shape {dims:?}"
            ),
        };
        // (1 - m) * -10000  ==  m * 10000 - 10000
        broadcast.affine(-MASK_PENALTY, MASK_PENALTY)
    }

    /// Forward pass: `[batch, seq]` token ids, `[batch, seq]` attention mask,
    /// `[batch, seq, kb_dim]` KB embeddings -> `[batch, seq]` logits.
    pub fn forward(&self, tokens: &Tensor, attn_mask: &Tensor, kb_embs: &Tensor) -> Result<Tensor> {
        let kb = self.kb_resize.forward(kb_embs)?;
        let emb = self.encoder.embed(tokens)?;
        if kb.dims() != emb.dims() {
            bail!(
                "KB embeddings resize to shape {:?} but token embeddings have shape {:?}",
                kb.dims(),
                emb.dims()
            );
        }
        let fused = (emb + kb)?;

        let attn_bias = self.extended_attention_mask(attn_mask)?;
        let hidden = self.encoder.encode(&fused, &attn_bias)?;

        self.classifier.forward(&hidden)?.squeeze(D::Minus1)
    }
}
