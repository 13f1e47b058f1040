//! Llama architecture in training form.
//!
//! Full-sequence forward pass with no generation-time KV cache; targeted
//! projections carry a low-rank adapter while the base weights stay frozen.

use candle_core::{DType, Device, Module, Result as CandleResult, Tensor, D};
use candle_nn::{embedding, Embedding, Linear, VarBuilder};
use serde::Deserialize;

use crate::kernels::AttentionKernel;
use crate::lora::{LoraAdapter, LoraConfig, LoraLinear};

/// Query rows per chunk for the memory-efficient kernel.
const QUERY_CHUNK: usize = 256;

/// A causal language model producing next-token logits.
pub trait CausalLM {
    /// Computes logits of shape `(batch, seq_len, vocab)`.
    ///
    /// # Errors
    ///
    /// Returns an error when a tensor operation fails.
    fn forward(&self, input_ids: &Tensor, train: bool) -> CandleResult<Tensor>;
}

/// Llama model configuration, deserialized from `config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct LlamaConfig {
    /// Hidden size (embedding dimension).
    pub hidden_size: usize,
    /// Intermediate size for the MLP.
    pub intermediate_size: usize,
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Number of hidden layers.
    pub num_hidden_layers: usize,
    /// Number of attention heads.
    pub num_attention_heads: usize,
    /// Number of key-value heads (for GQA).
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    /// RMS norm epsilon.
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    /// RoPE theta.
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    /// Maximum sequence length.
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    /// Tie word embeddings.
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

fn default_rms_norm_eps() -> f64 {
    1e-5
}

fn default_rope_theta() -> f64 {
    10000.0
}

fn default_max_position_embeddings() -> usize {
    4096
}

impl LlamaConfig {
    /// Loads the configuration from a `config.json` file.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> vapula_core::Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            vapula_core::Error::model_load(format!("{}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| vapula_core::Error::model_load(format!("{}: {e}", path.display())))
    }

    fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

/// Adapter wiring threaded through model construction: a variable builder
/// mirroring the base weight paths, plus the target list.
struct AdapterCtx<'a> {
    vb: VarBuilder<'a>,
    config: &'a LoraConfig,
}

impl<'a> AdapterCtx<'a> {
    fn pp(&self, name: impl ToString) -> AdapterCtx<'a> {
        AdapterCtx {
            vb: self.vb.pp(name),
            config: self.config,
        }
    }

    fn for_target(&self, name: &str) -> Option<(VarBuilder<'a>, &'a LoraConfig)> {
        self.config
            .is_target(name)
            .then(|| (self.vb.pp(name), self.config))
    }
}

struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    fn load(size: usize, eps: f64, vb: VarBuilder) -> CandleResult<Self> {
        let weight = vb.get(size, "weight")?;
        Ok(Self { weight, eps })
    }
}

impl Module for RmsNorm {
    fn forward(&self, x: &Tensor) -> CandleResult<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let variance = x.sqr()?.mean_keepdim(D::Minus1)?;
        let x_normed = x.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        x_normed.to_dtype(dtype)?.broadcast_mul(&self.weight)
    }
}

struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    fn new(config: &LlamaConfig, dtype: DType, device: &Device) -> CandleResult<Self> {
        let head_dim = config.head_dim();
        let theta = config.rope_theta;

        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0 / theta.powf(i as f64 / head_dim as f64) as f32)
            .collect();
        let inv_freq = Tensor::new(inv_freq.as_slice(), device)?;

        #[allow(clippy::cast_precision_loss)]
        let positions: Vec<f32> = (0..config.max_position_embeddings)
            .map(|p| p as f32)
            .collect();
        let positions = Tensor::new(positions.as_slice(), device)?.unsqueeze(1)?;

        let freqs = positions.matmul(&inv_freq.unsqueeze(0)?)?;
        let emb = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;

        Ok(Self {
            cos: emb.cos()?.to_dtype(dtype)?,
            sin: emb.sin()?.to_dtype(dtype)?,
        })
    }

    fn apply(&self, q: &Tensor, k: &Tensor) -> CandleResult<(Tensor, Tensor)> {
        let seq_len = q.dim(1)?;
        let cos = self.cos.narrow(0, 0, seq_len)?;
        let sin = self.sin.narrow(0, 0, seq_len)?;
        Ok((
            Self::apply_rotary(q, &cos, &sin)?,
            Self::apply_rotary(k, &cos, &sin)?,
        ))
    }

    // Rotate-half convention, matching how the pretrained weights were
    // trained.
    fn apply_rotary(x: &Tensor, cos: &Tensor, sin: &Tensor) -> CandleResult<Tensor> {
        let head_dim = x.dim(D::Minus1)?;
        let half = head_dim / 2;
        let x1 = x.narrow(D::Minus1, 0, half)?;
        let x2 = x.narrow(D::Minus1, half, half)?;
        let rotated = Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?;

        // (1, seq_len, 1, head_dim) against (batch, seq_len, heads, head_dim).
        let cos = cos.unsqueeze(0)?.unsqueeze(2)?;
        let sin = sin.unsqueeze(0)?.unsqueeze(2)?;
        x.broadcast_mul(&cos)? + rotated.broadcast_mul(&sin)?
    }
}

/// Scaled dot-product attention over already-transposed
/// `(batch, heads, seq, head_dim)` tensors.
fn scaled_dot_product(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
    scale: f64,
) -> CandleResult<Tensor> {
    let attn_weights = (q.matmul(&k.transpose(D::Minus2, D::Minus1)?)? / scale)?;
    let attn_weights = match mask {
        Some(m) => attn_weights.broadcast_add(m)?,
        None => attn_weights,
    };
    let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
    attn_weights.matmul(v)
}

/// The memory-efficient kernel: queries are processed in chunks so the
/// full `(seq, seq)` score matrix is never materialized at once. Softmax
/// normalizes over keys, so chunking the query rows is exact.
fn chunked_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
    scale: f64,
    chunk: usize,
) -> CandleResult<Tensor> {
    let seq_len = q.dim(2)?;
    if seq_len <= chunk {
        return scaled_dot_product(q, k, v, mask, scale);
    }
    let mut outputs = Vec::with_capacity(seq_len.div_ceil(chunk));
    let mut start = 0;
    while start < seq_len {
        let len = chunk.min(seq_len - start);
        let q_chunk = q.narrow(2, start, len)?.contiguous()?;
        let mask_chunk = mask.map(|m| m.narrow(0, start, len)).transpose()?;
        outputs.push(scaled_dot_product(
            &q_chunk,
            k,
            v,
            mask_chunk.as_ref(),
            scale,
        )?);
        start += len;
    }
    Tensor::cat(&outputs, 2)
}

struct Attention {
    q_proj: LoraLinear,
    k_proj: LoraLinear,
    v_proj: LoraLinear,
    o_proj: LoraLinear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    kernel: AttentionKernel,
}

impl Attention {
    fn load(
        config: &LlamaConfig,
        vb: VarBuilder,
        adapter: Option<&AdapterCtx>,
        kernel: AttentionKernel,
    ) -> CandleResult<Self> {
        let hidden_size = config.hidden_size;
        let num_heads = config.num_attention_heads;
        let num_kv_heads = config.num_kv_heads();
        let head_dim = config.head_dim();

        let proj = |name: &str, in_dim: usize, out_dim: usize| -> CandleResult<LoraLinear> {
            LoraLinear::load(
                in_dim,
                out_dim,
                vb.pp(name),
                adapter.and_then(|c| c.for_target(name)),
            )
        };

        Ok(Self {
            q_proj: proj("q_proj", hidden_size, num_heads * head_dim)?,
            k_proj: proj("k_proj", hidden_size, num_kv_heads * head_dim)?,
            v_proj: proj("v_proj", hidden_size, num_kv_heads * head_dim)?,
            o_proj: proj("o_proj", num_heads * head_dim, hidden_size)?,
            num_heads,
            num_kv_heads,
            head_dim,
            kernel,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        rotary: &RotaryEmbedding,
        mask: Option<&Tensor>,
        train: bool,
    ) -> CandleResult<Tensor> {
        let (batch_size, seq_len, _) = x.dims3()?;

        let q = self.q_proj.forward(x, train)?;
        let k = self.k_proj.forward(x, train)?;
        let v = self.v_proj.forward(x, train)?;

        let q = q.reshape((batch_size, seq_len, self.num_heads, self.head_dim))?;
        let k = k.reshape((batch_size, seq_len, self.num_kv_heads, self.head_dim))?;
        let v = v.reshape((batch_size, seq_len, self.num_kv_heads, self.head_dim))?;

        let (q, k) = rotary.apply(&q, &k)?;

        // (batch, num_heads, seq_len, head_dim)
        let q = q.transpose(1, 2)?.contiguous()?;
        let k = k.transpose(1, 2)?.contiguous()?;
        let v = v.transpose(1, 2)?.contiguous()?;

        let k = Self::repeat_kv(k, self.num_heads / self.num_kv_heads)?;
        let v = Self::repeat_kv(v, self.num_heads / self.num_kv_heads)?;

        #[allow(clippy::cast_precision_loss)]
        let scale = (self.head_dim as f64).sqrt();

        let attn_output = match self.kernel {
            #[cfg(feature = "flash-attn")]
            AttentionKernel::Flash => {
                // flash_attn wants (batch, seq, heads, head_dim) and applies
                // its own causal mask.
                #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
                let softmax_scale = (1.0 / scale) as f32;
                candle_flash_attn::flash_attn(
                    &q.transpose(1, 2)?,
                    &k.transpose(1, 2)?,
                    &v.transpose(1, 2)?,
                    softmax_scale,
                    seq_len > 1,
                )?
                .transpose(1, 2)?
            }
            AttentionKernel::MemoryEfficient => {
                chunked_attention(&q, &k, &v, mask, scale, QUERY_CHUNK)?
            }
            _ => scaled_dot_product(&q, &k, &v, mask, scale)?,
        };

        let attn_output = attn_output
            .transpose(1, 2)?
            .reshape((batch_size, seq_len, self.num_heads * self.head_dim))?;

        self.o_proj.forward(&attn_output, train)
    }

    fn repeat_kv(x: Tensor, n_rep: usize) -> CandleResult<Tensor> {
        if n_rep == 1 {
            return Ok(x);
        }
        let (batch, num_kv_heads, seq_len, head_dim) = x.dims4()?;
        x.unsqueeze(2)?
            .expand((batch, num_kv_heads, n_rep, seq_len, head_dim))?
            .reshape((batch, num_kv_heads * n_rep, seq_len, head_dim))
    }
}

struct Mlp {
    gate_proj: LoraLinear,
    up_proj: LoraLinear,
    down_proj: LoraLinear,
}

impl Mlp {
    fn load(config: &LlamaConfig, vb: VarBuilder, adapter: Option<&AdapterCtx>) -> CandleResult<Self> {
        let hidden_size = config.hidden_size;
        let intermediate_size = config.intermediate_size;

        let proj = |name: &str, in_dim: usize, out_dim: usize| -> CandleResult<LoraLinear> {
            LoraLinear::load(
                in_dim,
                out_dim,
                vb.pp(name),
                adapter.and_then(|c| c.for_target(name)),
            )
        };

        Ok(Self {
            gate_proj: proj("gate_proj", hidden_size, intermediate_size)?,
            up_proj: proj("up_proj", hidden_size, intermediate_size)?,
            down_proj: proj("down_proj", intermediate_size, hidden_size)?,
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> CandleResult<Tensor> {
        let gate = self.gate_proj.forward(x, train)?;
        let gate = candle_nn::ops::silu(&gate)?;
        let up = self.up_proj.forward(x, train)?;
        let x = (gate * up)?;
        self.down_proj.forward(&x, train)
    }
}

struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn load(
        config: &LlamaConfig,
        vb: VarBuilder,
        adapter: Option<&AdapterCtx>,
        kernel: AttentionKernel,
    ) -> CandleResult<Self> {
        let self_attn = Attention::load(
            config,
            vb.pp("self_attn"),
            adapter.map(|c| c.pp("self_attn")).as_ref(),
            kernel,
        )?;
        let mlp = Mlp::load(config, vb.pp("mlp"), adapter.map(|c| c.pp("mlp")).as_ref())?;
        let input_layernorm = RmsNorm::load(
            config.hidden_size,
            config.rms_norm_eps,
            vb.pp("input_layernorm"),
        )?;
        let post_attention_layernorm = RmsNorm::load(
            config.hidden_size,
            config.rms_norm_eps,
            vb.pp("post_attention_layernorm"),
        )?;

        Ok(Self {
            self_attn,
            mlp,
            input_layernorm,
            post_attention_layernorm,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        rotary: &RotaryEmbedding,
        mask: Option<&Tensor>,
        train: bool,
    ) -> CandleResult<Tensor> {
        let residual = x;
        let x = self.input_layernorm.forward(x)?;
        let x = self.self_attn.forward(&x, rotary, mask, train)?;
        let x = (residual + x)?;

        let residual = &x;
        let x = self.post_attention_layernorm.forward(&x)?;
        let x = self.mlp.forward(&x, train)?;
        residual + x
    }
}

/// A Llama model with low-rank adapters on the targeted projections.
pub struct AdaptedLlama {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    rotary: RotaryEmbedding,
    config: LlamaConfig,
    device: Device,
    dtype: DType,
}

impl AdaptedLlama {
    /// Builds the model from frozen base weights, attaching an adapter to
    /// every targeted projection when one is given. Every layer's attention
    /// runs through the given kernel strategy.
    ///
    /// # Errors
    ///
    /// Returns an error when weights are missing or shapes mismatch.
    pub fn load(
        config: LlamaConfig,
        vb: VarBuilder,
        adapter: Option<&LoraAdapter>,
        kernel: AttentionKernel,
    ) -> CandleResult<Self> {
        let device = vb.device().clone();
        let dtype = vb.dtype();

        let ctx = adapter.map(|a| AdapterCtx {
            vb: a.var_builder(dtype, &device),
            config: a.config(),
        });

        let embed_tokens = embedding(
            config.vocab_size,
            config.hidden_size,
            vb.pp("model.embed_tokens"),
        )?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            let layer = DecoderLayer::load(
                &config,
                vb.pp(format!("model.layers.{i}")),
                ctx.as_ref().map(|c| c.pp(format!("model.layers.{i}"))).as_ref(),
                kernel,
            )?;
            layers.push(layer);
        }

        let norm = RmsNorm::load(config.hidden_size, config.rms_norm_eps, vb.pp("model.norm"))?;

        let lm_head = if config.tie_word_embeddings {
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            candle_nn::linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("lm_head"))?
        };

        let rotary = RotaryEmbedding::new(&config, dtype, &device)?;

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary,
            config,
            device,
            dtype,
        })
    }

    /// The model configuration.
    #[must_use]
    pub fn config(&self) -> &LlamaConfig {
        &self.config
    }

    fn causal_mask(&self, seq_len: usize) -> CandleResult<Tensor> {
        let mask: Vec<f32> = (0..seq_len)
            .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
            .collect();
        Tensor::from_vec(mask, (seq_len, seq_len), &self.device)?.to_dtype(self.dtype)
    }
}

impl CausalLM for AdaptedLlama {
    fn forward(&self, input_ids: &Tensor, train: bool) -> CandleResult<Tensor> {
        let (_batch_size, seq_len) = input_ids.dims2()?;
        if seq_len > self.config.max_position_embeddings {
            candle_core::bail!(
                "sequence length {seq_len} exceeds maximum position embeddings {}",
                self.config.max_position_embeddings
            );
        }

        let mut hidden_states = self.embed_tokens.forward(input_ids)?;

        let mask = if seq_len > 1 {
            Some(self.causal_mask(seq_len)?)
        } else {
            None
        };

        for layer in &self.layers {
            hidden_states = layer.forward(&hidden_states, &self.rotary, mask.as_ref(), train)?;
        }

        let hidden_states = self.norm.forward(&hidden_states)?;
        self.lm_head.forward(&hidden_states)
    }
}

#[cfg(test)]
mod tests {
    use candle_nn::VarMap;

    use super::*;

    fn tiny_config() -> LlamaConfig {
        LlamaConfig {
            hidden_size: 16,
            intermediate_size: 32,
            vocab_size: 32,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            num_key_value_heads: Some(2),
            rms_norm_eps: 1e-5,
            rope_theta: 10000.0,
            max_position_embeddings: 64,
            tie_word_embeddings: false,
        }
    }

    #[test]
    fn forward_produces_vocab_logits() {
        let device = Device::Cpu;
        let base = VarMap::new();
        let vb = VarBuilder::from_varmap(&base, DType::F32, &device);
        let model = AdaptedLlama::load(tiny_config(), vb, None, AttentionKernel::Standard).unwrap();

        let ids = Tensor::zeros((2, 7), DType::U32, &device).unwrap();
        let logits = model.forward(&ids, false).unwrap();
        assert_eq!(logits.dims(), &[2, 7, 32]);
    }

    #[test]
    fn adapter_attaches_to_targeted_projections_only() {
        let device = Device::Cpu;
        let base = VarMap::new();
        let vb = VarBuilder::from_varmap(&base, DType::F32, &device);
        let config = tiny_config();
        let lora_config = crate::lora::LoraConfig {
            r: 2,
            target_modules: vec!["q_proj".to_string(), "v_proj".to_string()],
            ..crate::lora::LoraConfig::default()
        };
        let adapter = LoraAdapter::new(lora_config).unwrap();
        let _model =
            AdaptedLlama::load(config, vb, Some(&adapter), AttentionKernel::Standard).unwrap();

        // Two targets, two layers, an A and a B each.
        assert_eq!(adapter.trainable_vars().len(), 2 * 2 * 2);
    }

    #[test]
    fn zero_init_adapter_matches_base_model() {
        let device = Device::Cpu;
        let base = VarMap::new();
        let config = tiny_config();

        let vb = VarBuilder::from_varmap(&base, DType::F32, &device);
        let plain = AdaptedLlama::load(config.clone(), vb, None, AttentionKernel::Standard).unwrap();

        let adapter = LoraAdapter::new(crate::lora::LoraConfig {
            r: 2,
            ..crate::lora::LoraConfig::default()
        })
        .unwrap();
        let vb = VarBuilder::from_varmap(&base, DType::F32, &device);
        let adapted =
            AdaptedLlama::load(config, vb, Some(&adapter), AttentionKernel::Standard).unwrap();

        let ids = Tensor::zeros((1, 5), DType::U32, &device).unwrap();
        let a = plain.forward(&ids, false).unwrap();
        let b = adapted.forward(&ids, false).unwrap();
        let diff = max_abs_diff(&a, &b);
        assert!(diff < 1e-5);
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        a.sub(b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn memory_efficient_kernel_matches_standard() {
        let device = Device::Cpu;
        let base = VarMap::new();
        let config = tiny_config();

        let vb = VarBuilder::from_varmap(&base, DType::F32, &device);
        let standard =
            AdaptedLlama::load(config.clone(), vb, None, AttentionKernel::Standard).unwrap();
        let vb = VarBuilder::from_varmap(&base, DType::F32, &device);
        let chunked =
            AdaptedLlama::load(config, vb, None, AttentionKernel::MemoryEfficient).unwrap();

        let ids = Tensor::zeros((1, 9), DType::U32, &device).unwrap();
        let a = standard.forward(&ids, false).unwrap();
        let b = chunked.forward(&ids, false).unwrap();
        assert!(max_abs_diff(&a, &b) < 1e-5);
    }

    #[test]
    fn chunked_queries_match_full_attention() {
        let device = Device::Cpu;
        let (heads, seq_len, head_dim) = (2, 6, 4);
        let q = Tensor::randn(0f32, 1f32, (1, heads, seq_len, head_dim), &device).unwrap();
        let k = Tensor::randn(0f32, 1f32, (1, heads, seq_len, head_dim), &device).unwrap();
        let v = Tensor::randn(0f32, 1f32, (1, heads, seq_len, head_dim), &device).unwrap();
        let mask: Vec<f32> = (0..seq_len)
            .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
            .collect();
        let mask = Tensor::from_vec(mask, (seq_len, seq_len), &device).unwrap();
        #[allow(clippy::cast_precision_loss)]
        let scale = (head_dim as f64).sqrt();

        let full = scaled_dot_product(&q, &k, &v, Some(&mask), scale).unwrap();
        // A chunk smaller than the sequence forces multiple passes.
        let chunked = chunked_attention(&q, &k, &v, Some(&mask), scale, 2).unwrap();
        assert_eq!(full.dims(), chunked.dims());
        assert!(max_abs_diff(&full, &chunked) < 1e-5);
    }
}
