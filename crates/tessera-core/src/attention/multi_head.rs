//! Multi-head attention with grouped key/value heads.
//!
//! One call runs: project Q/K/V, rotate Q and K, update the cache, score with
//! the configured backend, merge heads, project the output.

use super::{AttentionBackend, AttentionImpl, EagerBackend, ScoreContext};
use crate::cache::{CacheKwargs, CacheMode, KvCache};
use crate::diagnostics::{Diagnostics, WarningKey};
use crate::error::{check_shape, Result, TesseraError};
use crate::mask::AttentionMaskBuilder;
use crate::model::AttentionConfig;
use crate::rope::{apply_rotary_pos_emb, RotaryEmbedding};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Linear, Module};

/// Per-call switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardOptions {
    /// Training mode: enables attention dropout.
    pub training: bool,
    /// Return attention probabilities (forces the eager backend).
    pub output_attentions: bool,
    /// Cache write position; `None` appends at the layer's current length.
    pub cache_position: Option<usize>,
}

/// Q/K/V/O linear maps of one attention block.
#[derive(Debug, Clone)]
pub struct AttentionProjections {
    /// Query projection: [num_heads * head_dim, hidden_size]
    pub q_proj: Linear,
    /// Key projection: [num_kv_heads * head_dim, hidden_size]
    pub k_proj: Linear,
    /// Value projection: [num_kv_heads * head_dim, hidden_size]
    pub v_proj: Linear,
    /// Output projection: [hidden_size, num_heads * head_dim]
    pub o_proj: Linear,
}

impl AttentionProjections {
    /// Bundle already-loaded projections.
    pub fn new(q_proj: Linear, k_proj: Linear, v_proj: Linear, o_proj: Linear) -> Self {
        Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
        }
    }

    /// Random projections sized for `config` (for testing).
    pub fn random(config: &AttentionConfig, dtype: DType, device: &Device) -> Result<Self> {
        let hidden = config.hidden_size;
        let bias = config.attention_bias;
        Ok(Self {
            q_proj: random_linear(config.q_dim(), hidden, bias, dtype, device)?,
            k_proj: random_linear(config.kv_dim(), hidden, bias, dtype, device)?,
            v_proj: random_linear(config.kv_dim(), hidden, bias, dtype, device)?,
            o_proj: random_linear(hidden, config.q_dim(), bias, dtype, device)?,
        })
    }

    /// Dtype of the weights; inputs are cast to it.
    pub fn dtype(&self) -> DType {
        self.q_proj.weight().dtype()
    }
}

/// Random `[out, in]` linear map scaled by `1/sqrt(in)`.
pub(crate) fn random_linear(
    out_features: usize,
    in_features: usize,
    bias: bool,
    dtype: DType,
    device: &Device,
) -> Result<Linear> {
    let std = 1.0 / (in_features as f32).sqrt();
    let weight = Tensor::randn(0.0f32, std, (out_features, in_features), device)?.to_dtype(dtype)?;
    let bias = if bias {
        Some(Tensor::randn(0.0f32, std, out_features, device)?.to_dtype(dtype)?)
    } else {
        None
    };
    Ok(Linear::new(weight, bias))
}

fn check_linear(what: &'static str, linear: &Linear, out_features: usize, in_features: usize) -> Result<()> {
    check_shape(what, &[out_features, in_features], linear.weight().dims())?;
    if let Some(bias) = linear.bias() {
        check_shape(what, &[out_features], bias.dims())?;
    }
    Ok(())
}

/// Multi-head attention block.
#[derive(Debug)]
pub struct MultiHeadAttention {
    /// Linear maps.
    proj: AttentionProjections,
    /// Index of the owning layer; selects the cache slot.
    layer_idx: usize,
    /// Number of attention heads.
    num_heads: usize,
    /// Number of key-value heads (for GQA).
    num_kv_heads: usize,
    /// Head dimension.
    head_dim: usize,
    /// Hidden size.
    hidden_size: usize,
    /// Dropout on attention probabilities.
    attention_dropout: f32,
    /// Rotate queries and keys.
    use_rotary: bool,
    /// Configured backend.
    implementation: AttentionImpl,
    backend: Box<dyn AttentionBackend>,
    /// Used when weights are requested from a backend that cannot return them.
    fallback: EagerBackend,
    diagnostics: Diagnostics,
}

impl MultiHeadAttention {
    /// Create attention with provided weights.
    ///
    /// Fails with [`TesseraError::Config`] if the config is inconsistent and
    /// with [`TesseraError::ShapeMismatch`] if a projection has the wrong shape.
    pub fn new(
        config: &AttentionConfig,
        layer_idx: usize,
        proj: AttentionProjections,
        diagnostics: Diagnostics,
    ) -> Result<Self> {
        config.validate()?;
        let hidden = config.hidden_size;
        check_linear("q_proj", &proj.q_proj, config.q_dim(), hidden)?;
        check_linear("k_proj", &proj.k_proj, config.kv_dim(), hidden)?;
        check_linear("v_proj", &proj.v_proj, config.kv_dim(), hidden)?;
        check_linear("o_proj", &proj.o_proj, hidden, config.q_dim())?;

        Ok(Self {
            proj,
            layer_idx,
            num_heads: config.num_attention_heads,
            num_kv_heads: config.num_key_value_heads,
            head_dim: config.head_dim(),
            hidden_size: hidden,
            attention_dropout: config.attention_dropout,
            use_rotary: config.use_rotary,
            implementation: config.attn_implementation,
            backend: config.attn_implementation.backend(),
            fallback: EagerBackend,
            diagnostics,
        })
    }

    /// Create attention with random weights (for testing).
    pub fn random(
        config: &AttentionConfig,
        layer_idx: usize,
        dtype: DType,
        device: &Device,
        diagnostics: Diagnostics,
    ) -> Result<Self> {
        let proj = AttentionProjections::random(config, dtype, device)?;
        Self::new(config, layer_idx, proj, diagnostics)
    }

    /// Causal self-attention over `hidden` and, when given, the cached history.
    ///
    /// # Arguments
    ///
    /// * `hidden` - Input tensor [batch, seq_len, hidden_size]
    /// * `mask` - Additive mask [batch | 1, 1, seq_len, >= key_len], absolute
    ///   positions; `None` lets the backend enforce causality itself
    /// * `positions` - Position ids [batch, seq_len]
    /// * `rope` - Rotary embedding; required unless rotary encoding is off
    /// * `cache` - Session cache to read from and update
    /// * `options` - Per-call switches
    ///
    /// # Returns
    ///
    /// Output [batch, seq_len, hidden_size] and, if requested, attention
    /// probabilities [batch, num_heads, seq_len, key_len].
    pub fn forward(
        &self,
        hidden: &Tensor,
        mask: Option<&Tensor>,
        positions: &Tensor,
        rope: Option<&RotaryEmbedding>,
        cache: Option<&mut KvCache>,
        options: &ForwardOptions,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let hidden = self.prepare_input(hidden)?;
        let (batch, seq_len, _) = hidden.dims3()?;

        let q = self.split_heads(&self.proj.q_proj.forward(&hidden)?, self.num_heads)?;
        let k = self.split_heads(&self.proj.k_proj.forward(&hidden)?, self.num_kv_heads)?;
        let v = self.split_heads(&self.proj.v_proj.forward(&hidden)?, self.num_kv_heads)?;

        let (q, k, rotary) = if self.use_rotary {
            let rope = rope.ok_or_else(|| {
                TesseraError::Config("rotary attention needs a rotary embedding".to_string())
            })?;
            check_shape("position ids", &[batch, seq_len], positions.dims())?;
            let (cos, sin) = rope.cos_sin(positions, q.dtype())?;
            let (q, k) = apply_rotary_pos_emb(&q, &k, &cos, &sin)?;
            (q, k, Some((cos, sin)))
        } else {
            (q, k, None)
        };

        let (k, v, buffer_mask) = match cache {
            Some(cache) => {
                let cache_position = match options.cache_position {
                    Some(position) => position,
                    None => cache.length(self.layer_idx)?,
                };
                let kwargs = CacheKwargs {
                    cache_position,
                    cos: rotary.as_ref().map(|(cos, _)| cos),
                    sin: rotary.as_ref().map(|(_, sin)| sin),
                };
                let (k, v) = cache.update(self.layer_idx, &k, &v, kwargs)?;
                // A static buffer exposes unwritten slots; hide them.
                let buffer_mask = match (mask, cache.mode()) {
                    (None, CacheMode::Static { max_len }) => AttentionMaskBuilder::new(q.dtype(), q.device())?
                        .build(None, seq_len, max_len, cache_position, false)?,
                    _ => None,
                };
                (k, v, buffer_mask)
            }
            None => (k, v, None),
        };

        self.attend(&q, &k, &v, mask.or(buffer_mask.as_ref()), true, options)
    }

    /// Non-causal attention from `hidden` onto encoder states.
    ///
    /// Encoder keys/values are projected once and stored in the cache; later
    /// calls reuse them and may omit `encoder_states`.
    ///
    /// # Arguments
    ///
    /// * `hidden` - Decoder states [batch, seq_len, hidden_size]
    /// * `encoder_states` - Encoder output [batch, src_len, hidden_size]
    /// * `encoder_mask` - Additive bias [batch | 1, 1, seq_len, src_len]
    /// * `cache` - Session cache holding the projected encoder keys/values
    /// * `options` - Per-call switches
    pub fn forward_cross(
        &self,
        hidden: &Tensor,
        encoder_states: Option<&Tensor>,
        encoder_mask: Option<&Tensor>,
        cache: Option<&mut KvCache>,
        options: &ForwardOptions,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let hidden = self.prepare_input(hidden)?;
        let q = self.split_heads(&self.proj.q_proj.forward(&hidden)?, self.num_heads)?;

        let cached = match cache.as_deref() {
            Some(cache) => cache
                .cross_kv(self.layer_idx)?
                .map(|kv| (kv.key.clone(), kv.value.clone())),
            None => None,
        };

        let (k, v) = match cached {
            Some(kv) => kv,
            None => {
                let encoder = encoder_states.ok_or_else(|| {
                    TesseraError::Config(
                        "cross-attention needs encoder states on its first call".to_string(),
                    )
                })?;
                let encoder = self.prepare_input(encoder)?;
                let k = self.split_heads(&self.proj.k_proj.forward(&encoder)?, self.num_kv_heads)?;
                let v = self.split_heads(&self.proj.v_proj.forward(&encoder)?, self.num_kv_heads)?;
                if let Some(cache) = cache {
                    cache.set_cross_kv(self.layer_idx, k.clone(), v.clone())?;
                }
                (k, v)
            }
        };

        self.attend(&q, &k, &v, encoder_mask, false, options)
    }

    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        is_causal: bool,
        options: &ForwardOptions,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let backend: &dyn AttentionBackend =
            if options.output_attentions && !self.implementation.returns_weights() {
                self.diagnostics.warn_once(
                    WarningKey::AttentionWeightsFallback {
                        requested: self.implementation,
                    },
                    &format!(
                        "{} attention cannot return attention weights; falling back to eager attention",
                        self.implementation
                    ),
                );
                &self.fallback
            } else {
                self.backend.as_ref()
            };

        let ctx = ScoreContext {
            scale: 1.0 / (self.head_dim as f64).sqrt(),
            n_rep: self.num_heads / self.num_kv_heads,
            is_causal,
            dropout: self.attention_dropout,
            training: options.training,
            output_attentions: options.output_attentions,
        };

        let (output, weights) = backend.score_and_combine(q, k, v, mask, &ctx)?;

        let (batch, _, seq_len, _) = q.dims4()?;
        let key_len = k.dim(2)?;
        check_shape(
            "attention output",
            &[batch, self.num_heads, seq_len, self.head_dim],
            output.dims(),
        )?;
        if let Some(weights) = &weights {
            check_shape(
                "attention weights",
                &[batch, self.num_heads, seq_len, key_len],
                weights.dims(),
            )?;
        }

        // Transpose and reshape: [batch, seq, num_heads * head_dim]
        let output = output
            .transpose(1, 2)?
            .reshape((batch, seq_len, self.num_heads * self.head_dim))?;
        let output = self.proj.o_proj.forward(&output)?;
        Ok((output, weights))
    }

    /// [batch, seq, heads * head_dim] -> [batch, heads, seq, head_dim]
    fn split_heads(&self, x: &Tensor, heads: usize) -> Result<Tensor> {
        let (batch, seq_len, _) = x.dims3()?;
        Ok(x
            .reshape((batch, seq_len, heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    /// Check the hidden width and cast to the weight dtype, warning once.
    pub(crate) fn prepare_input(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, width) = match x.dims() {
            [b, s, w] => (*b, *s, *w),
            other => {
                return Err(TesseraError::shape(
                    "hidden states",
                    &[0, 0, self.hidden_size],
                    other,
                ))
            }
        };
        check_shape("hidden states", &[batch, seq_len, self.hidden_size], &[batch, seq_len, width])?;

        let dtype = self.proj.dtype();
        if x.dtype() == dtype {
            return Ok(x.clone());
        }
        self.diagnostics.warn_once(
            WarningKey::InputUpcast {
                from: x.dtype().as_str(),
                to: dtype.as_str(),
            },
            &format!(
                "attention input arrived as {} while weights are {}; casting",
                x.dtype().as_str(),
                dtype.as_str()
            ),
        );
        Ok(x.to_dtype(dtype)?)
    }

    /// Get the layer index.
    pub fn layer_idx(&self) -> usize {
        self.layer_idx
    }

    /// Get the number of heads.
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Get the number of KV heads.
    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    /// Get the head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Configured backend.
    pub fn implementation(&self) -> AttentionImpl {
        self.implementation
    }

    /// Linear maps.
    pub fn projections(&self) -> &AttentionProjections {
        &self.proj
    }
}
