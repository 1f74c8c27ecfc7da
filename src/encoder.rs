//! Pretrained transformer encoder.
//!
//! The fusion model only needs two capabilities from the encoder: an embedding
//! lookup and an encode step over already-fused embeddings. Both sit behind the
//! [`Encoder`] trait so the fusion logic can be tested with a stub.
//!
//! [`PretrainedEncoder`] is a BERT-style post-LN stack built from `candle_nn`
//! primitives, loaded by filesystem convention from `config.json` +
//! `model.safetensors`.

use std::path::Path;

use candle_core::{D, Device, Result, Tensor};
use candle_nn::{Embedding, LayerNorm, Linear, Module, VarBuilder, VarMap};
use serde::Deserialize;

/// Capability interface consumed by the fusion model.
pub trait Encoder {
    /// Hidden width of the encoder's representations.
    fn hidden_size(&self) -> usize;

    /// Whether the stack runs as a decoder, requiring a causal mask.
    fn is_causal(&self) -> bool {
        false
    }

    /// Look up input embeddings for `[batch, seq]` token ids.
    fn embed(&self, tokens: &Tensor) -> Result<Tensor>;

    /// Run the layer stack over `[batch, seq, hidden]` embeddings with an
    /// additive attention bias broadcastable to `[batch, heads, seq, seq]`.
    fn encode(&self, embeddings: &Tensor, attn_bias: &Tensor) -> Result<Tensor>;
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

/// Encoder hyperparameters, read from `config.json` next to the weights.
#[derive(Debug, Clone, Deserialize)]
pub struct EncoderConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub max_position_embeddings: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default)]
    pub is_decoder: bool,
}

/// Token + learned position embeddings with a final layer norm.
struct Embeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    layer_norm: LayerNorm,
    device: Device,
}

impl Embeddings {
    fn load(config: &EncoderConfig, vb: VarBuilder) -> Result<Self> {
        let word_embeddings = candle_nn::embedding(
            config.vocab_size,
            config.hidden_size,
            vb.pp("word_embeddings"),
        )?;
        let position_embeddings = candle_nn::embedding(
            config.max_position_embeddings,
            config.hidden_size,
            vb.pp("position_embeddings"),
        )?;
        let layer_norm = candle_nn::layer_norm(
            config.hidden_size,
            config.layer_norm_eps,
            vb.pp("layer_norm"),
        )?;
        Ok(Self {
            word_embeddings,
            position_embeddings,
            layer_norm,
            device: vb.device().clone(),
        })
    }

    fn forward(&self, tokens: &Tensor) -> Result<Tensor> {
        let (_batch, seq_len) = tokens.dims2()?;
        let word = self.word_embeddings.forward(tokens)?;
        let position_ids = Tensor::arange(0u32, seq_len as u32, &self.device)?.unsqueeze(0)?;
        let position = self.position_embeddings.forward(&position_ids)?;
        let embeddings = word.broadcast_add(&position)?;
        self.layer_norm.forward(&embeddings)
    }
}

struct SelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl SelfAttention {
    fn load(config: &EncoderConfig, vb: VarBuilder) -> Result<Self> {
        let h = config.hidden_size;
        Ok(Self {
            query: candle_nn::linear(h, h, vb.pp("query"))?,
            key: candle_nn::linear(h, h, vb.pp("key"))?,
            value: candle_nn::linear(h, h, vb.pp("value"))?,
            output: candle_nn::linear(h, h, vb.pp("output"))?,
            num_heads: config.num_attention_heads,
            head_dim: h / config.num_attention_heads,
        })
    }

    /// Split `[b, s, h]` into `[b, heads, s, head_dim]`.
    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, _hidden) = xs.dims3()?;
        xs.reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn forward(&self, hidden: &Tensor, attn_bias: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, hidden_size) = hidden.dims3()?;
        let q = self.split_heads(&self.query.forward(hidden)?)?;
        let k = self.split_heads(&self.key.forward(hidden)?)?;
        let v = self.split_heads(&self.value.forward(hidden)?)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)? * scale)?;
        // Suppressed positions carry -10000.0 in the bias and vanish after softmax.
        let scores = scores.broadcast_add(attn_bias)?;
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;

        let context = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_len, hidden_size))?;
        self.output.forward(&context)
    }
}

struct EncoderLayer {
    attention: SelfAttention,
    attention_norm: LayerNorm,
    intermediate: Linear,
    ffn_output: Linear,
    output_norm: LayerNorm,
}

impl EncoderLayer {
    fn load(config: &EncoderConfig, vb: VarBuilder) -> Result<Self> {
        let h = config.hidden_size;
        Ok(Self {
            attention: SelfAttention::load(config, vb.pp("attention"))?,
            attention_norm: candle_nn::layer_norm(h, config.layer_norm_eps, vb.pp("attention_norm"))?,
            intermediate: candle_nn::linear(h, config.intermediate_size, vb.pp("intermediate"))?,
            ffn_output: candle_nn::linear(config.intermediate_size, h, vb.pp("ffn_output"))?,
            output_norm: candle_nn::layer_norm(h, config.layer_norm_eps, vb.pp("output_norm"))?,
        })
    }

    fn forward(&self, hidden: &Tensor, attn_bias: &Tensor) -> Result<Tensor> {
        let attn = self.attention.forward(hidden, attn_bias)?;
        let hidden = self.attention_norm.forward(&(hidden + attn)?)?;
        let ffn = self.ffn_output.forward(&self.intermediate.forward(&hidden)?.gelu_erf()?)?;
        self.output_norm.forward(&(&hidden + ffn)?)
    }
}

/// A pretrained encoder: embedding table plus a stack of self-attention layers.
pub struct PretrainedEncoder {
    embeddings: Embeddings,
    layers: Vec<EncoderLayer>,
    hidden_size: usize,
    is_decoder: bool,
}

impl PretrainedEncoder {
    /// Build the module graph under `vb`. Weights come from whatever backs the
    /// builder: a `VarMap` for training, a safetensors mmap for inference.
    pub fn new(config: &EncoderConfig, vb: VarBuilder) -> Result<Self> {
        let embeddings = Embeddings::load(config, vb.pp("embeddings"))?;
        let layers = (0..config.num_hidden_layers)
            .map(|i| EncoderLayer::load(config, vb.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            embeddings,
            layers,
            hidden_size: config.hidden_size,
            is_decoder: config.is_decoder,
        })
    }

    /// Read `config.json` from the encoder directory.
    pub fn read_config(dir: &Path) -> Result<EncoderConfig> {
        let path = dir.join("config.json");
        let content = std::fs::read_to_string(&path)
            .map_err(|e| candle_core::Error::Msg(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&content)
            .map_err(|e| candle_core::Error::Msg(format!("cannot parse {}: {e}", path.display())))
    }
}

impl Encoder for PretrainedEncoder {
    fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn is_causal(&self) -> bool {
        self.is_decoder
    }

    fn embed(&self, tokens: &Tensor) -> Result<Tensor> {
        self.embeddings.forward(tokens)
    }

    fn encode(&self, embeddings: &Tensor, attn_bias: &Tensor) -> Result<Tensor> {
        let mut hidden = embeddings.clone();
        for layer in &self.layers {
            hidden = layer.forward(&hidden, attn_bias)?;
        }
        Ok(hidden)
    }
}

/// Copy pretrained tensors into the matching entries of a training `VarMap`.
///
/// Entries under `prefix` are looked up in the file with the prefix stripped;
/// names absent from the file (the randomly initialized heads) are left as-is.
/// Returns the number of tensors loaded.
pub fn load_pretrained_weights(varmap: &VarMap, path: &Path, prefix: &str) -> Result<usize> {
    let tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
    let mut loaded = 0usize;
    let data = varmap.data().lock().unwrap();
    for (name, var) in data.iter() {
        let Some(stripped) = name.strip_prefix(prefix) else {
            continue;
        };
        if let Some(tensor) = tensors.get(stripped) {
            var.set(&tensor.to_device(var.device())?.to_dtype(var.dtype())?)?;
            loaded += 1;
        }
    }
    Ok(loaded)
}
