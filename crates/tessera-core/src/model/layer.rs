//! Transformer decoder layer.
//!
//! A single decoder layer combining:
//! - Self-attention with its norm
//! - Optional cross-attention onto encoder states with its norm
//! - Feed-forward block with its norm
//!
//! Pre-norm layers normalize each block's input and add the raw input back;
//! post-norm layers normalize after the residual addition.

use super::{AttentionConfig, FeedForward, Norm, NormPlacement};
use crate::attention::{AttentionProjections, ForwardOptions, MultiHeadAttention};
use crate::cache::KvCache;
use crate::diagnostics::Diagnostics;
use crate::error::{Result, TesseraError};
use crate::rope::RotaryEmbedding;
use candle_core::{DType, Device, Tensor};

/// Encoder output seen by cross-attention.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncoderContext<'a> {
    /// Encoder hidden states [batch, src_len, hidden_size]; may be omitted once
    /// the cache holds the projected keys/values.
    pub states: Option<&'a Tensor>,
    /// Additive bias [batch | 1, 1, seq_len, src_len].
    pub mask: Option<&'a Tensor>,
}

/// Weights of one decoder layer.
#[derive(Debug, Clone)]
pub struct LayerWeights {
    /// Self-attention projections.
    pub self_attn: AttentionProjections,
    /// Norm around self-attention.
    pub self_attn_norm: Norm,
    /// Cross-attention projections and norm.
    pub cross_attn: Option<(AttentionProjections, Norm)>,
    /// Feed-forward block.
    pub feed_forward: FeedForward,
    /// Norm around the feed-forward block.
    pub ffn_norm: Norm,
}

impl LayerWeights {
    /// Random weights and identity norms (for testing).
    pub fn random(config: &AttentionConfig, dtype: DType, device: &Device) -> Result<Self> {
        let norm = || {
            Norm::ones(
                config.norm_kind,
                config.hidden_size,
                config.norm_eps,
                dtype,
                device,
            )
        };
        let cross_attn = if config.add_cross_attention {
            Some((AttentionProjections::random(config, dtype, device)?, norm()?))
        } else {
            None
        };
        Ok(Self {
            self_attn: AttentionProjections::random(config, dtype, device)?,
            self_attn_norm: norm()?,
            cross_attn,
            feed_forward: FeedForward::random(config, dtype, device)?,
            ffn_norm: norm()?,
        })
    }
}

/// Result of one layer.
#[derive(Debug, Clone)]
pub struct LayerOutput {
    /// Output hidden states [batch, seq_len, hidden_size].
    pub hidden: Tensor,
    /// Self-attention probabilities, when requested.
    pub attn_weights: Option<Tensor>,
    /// Cross-attention probabilities, when requested.
    pub cross_attn_weights: Option<Tensor>,
}

#[derive(Debug)]
struct CrossAttention {
    attn: MultiHeadAttention,
    norm: Norm,
}

/// A single transformer decoder layer.
#[derive(Debug)]
pub struct DecoderLayer {
    self_attn: MultiHeadAttention,
    self_attn_norm: Norm,
    cross_attn: Option<CrossAttention>,
    feed_forward: FeedForward,
    ffn_norm: Norm,
    /// Fixed per model.
    placement: NormPlacement,
    /// Layer index (selects the cache slot).
    layer_idx: usize,
}

impl DecoderLayer {
    /// Create a decoder layer from loaded weights.
    pub fn new(
        config: &AttentionConfig,
        layer_idx: usize,
        weights: LayerWeights,
        diagnostics: Diagnostics,
    ) -> Result<Self> {
        let cross_attn = match (config.add_cross_attention, weights.cross_attn) {
            (true, Some((proj, norm))) => {
                // Encoder positions are absolute; cross-attention never rotates.
                let cross_config = AttentionConfig {
                    use_rotary: false,
                    ..config.clone()
                };
                Some(CrossAttention {
                    attn: MultiHeadAttention::new(&cross_config, layer_idx, proj, diagnostics.clone())?,
                    norm,
                })
            }
            (false, None) => None,
            (expected, _) => {
                return Err(TesseraError::Config(format!(
                    "layer {layer_idx}: add_cross_attention is {expected} but cross-attention weights {}",
                    if expected { "are missing" } else { "were supplied" }
                )))
            }
        };

        Ok(Self {
            self_attn: MultiHeadAttention::new(config, layer_idx, weights.self_attn, diagnostics)?,
            self_attn_norm: weights.self_attn_norm,
            cross_attn,
            feed_forward: weights.feed_forward,
            ffn_norm: weights.ffn_norm,
            placement: config.norm_placement,
            layer_idx,
        })
    }

    /// Create a decoder layer with random weights (for testing).
    pub fn random(
        config: &AttentionConfig,
        layer_idx: usize,
        dtype: DType,
        device: &Device,
        diagnostics: Diagnostics,
    ) -> Result<Self> {
        let weights = LayerWeights::random(config, dtype, device)?;
        Self::new(config, layer_idx, weights, diagnostics)
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `hidden` - Input tensor [batch, seq_len, hidden_size]
    /// * `mask` - Absolute additive causal mask, or `None` for implicit causality
    /// * `positions` - Position ids [batch, seq_len]
    /// * `rope` - Rotary embedding (unused when rotary encoding is off)
    /// * `cache` - Session cache to read from and update
    /// * `encoder` - Encoder context for cross-attention layers
    /// * `options` - Per-call switches
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        hidden: &Tensor,
        mask: Option<&Tensor>,
        positions: &Tensor,
        rope: Option<&RotaryEmbedding>,
        mut cache: Option<&mut KvCache>,
        encoder: Option<&EncoderContext<'_>>,
        options: &ForwardOptions,
    ) -> Result<LayerOutput> {
        let hidden = self.self_attn.prepare_input(hidden)?;
        let pre_norm = self.placement == NormPlacement::Pre;

        // Self-attention block
        let input = if pre_norm {
            self.self_attn_norm.forward(&hidden)?
        } else {
            hidden.clone()
        };
        let (attn, attn_weights) =
            self.self_attn
                .forward(&input, mask, positions, rope, cache.as_deref_mut(), options)?;
        let mut hidden = self.residual(&hidden, &attn, &self.self_attn_norm, pre_norm)?;

        // Cross-attention block
        let mut cross_attn_weights = None;
        if let Some(cross) = &self.cross_attn {
            let encoder = encoder.copied().unwrap_or_default();
            let input = if pre_norm {
                cross.norm.forward(&hidden)?
            } else {
                hidden.clone()
            };
            let (out, weights) = cross.attn.forward_cross(
                &input,
                encoder.states,
                encoder.mask,
                cache.as_deref_mut(),
                options,
            )?;
            hidden = self.residual(&hidden, &out, &cross.norm, pre_norm)?;
            cross_attn_weights = weights;
        }

        // Feed-forward block
        let input = if pre_norm {
            self.ffn_norm.forward(&hidden)?
        } else {
            hidden.clone()
        };
        let ffn = self.feed_forward.forward(&input)?;
        let hidden = self.residual(&hidden, &ffn, &self.ffn_norm, pre_norm)?;

        Ok(LayerOutput {
            hidden,
            attn_weights,
            cross_attn_weights,
        })
    }

    fn residual(&self, residual: &Tensor, block: &Tensor, norm: &Norm, pre_norm: bool) -> Result<Tensor> {
        let sum = (residual + block)?;
        if pre_norm {
            Ok(sum)
        } else {
            norm.forward(&sum)
        }
    }

    /// Get the layer index.
    pub fn layer_idx(&self) -> usize {
        self.layer_idx
    }

    /// Get the self-attention module.
    pub fn self_attn(&self) -> &MultiHeadAttention {
        &self.self_attn
    }

    /// Whether the layer attends to encoder states.
    pub fn has_cross_attention(&self) -> bool {
        self.cross_attn.is_some()
    }

    /// Norm placement.
    pub fn placement(&self) -> NormPlacement {
        self.placement
    }
}
