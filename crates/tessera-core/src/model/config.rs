//! Model configuration.

use crate::attention::AttentionImpl;
use crate::error::{Result, TesseraError};
use crate::rope::RopeScaling;
use serde::{Deserialize, Serialize};

/// Normalization flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormKind {
    /// Root-mean-square normalization (Llama family).
    #[default]
    Rms,
    /// Mean/variance layer normalization with bias (BART family).
    Layer,
}

/// Where normalization sits relative to each residual block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormPlacement {
    /// Normalize the block input; residual adds the raw input.
    #[default]
    Pre,
    /// Normalize after the residual addition.
    Post,
}

/// Feed-forward block flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedForwardKind {
    /// Gated SiLU MLP.
    #[default]
    SwiGlu,
    /// Two-layer GELU MLP with bias.
    Gelu,
}

/// Configuration for the attention engine and the decoder stack around it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttentionConfig {
    /// Hidden dimension.
    pub hidden_size: usize,
    /// Intermediate dimension (FFN).
    pub intermediate_size: usize,
    /// Number of attention heads.
    pub num_attention_heads: usize,
    /// Number of KV heads (for GQA).
    pub num_key_value_heads: usize,
    /// Number of layers.
    pub num_hidden_layers: usize,
    /// Head dimension; 0 derives it from `hidden_size / num_attention_heads`.
    #[serde(default)]
    pub head_dim: usize,
    /// Maximum sequence length seen in training.
    pub max_position_embeddings: usize,
    /// Rope theta.
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    /// Rotary scaling policy.
    #[serde(default)]
    pub rope_scaling: Option<RopeScaling>,
    /// Fraction of each head that is rotated.
    #[serde(default = "default_partial_rotary_factor")]
    pub partial_rotary_factor: f64,
    /// Rotary encoding on queries/keys; off for absolute-position models.
    #[serde(default = "default_true")]
    pub use_rotary: bool,
    /// Dropout on attention probabilities (training only).
    #[serde(default)]
    pub attention_dropout: f32,
    /// Probability of skipping a whole layer (training only).
    #[serde(default)]
    pub layerdrop: f32,
    /// Bias on the Q/K/V/O projections.
    #[serde(default)]
    pub attention_bias: bool,
    /// Norm epsilon.
    #[serde(default = "default_norm_eps", alias = "rms_norm_eps")]
    pub norm_eps: f64,
    /// Norm flavour.
    #[serde(default)]
    pub norm_kind: NormKind,
    /// Norm placement.
    #[serde(default)]
    pub norm_placement: NormPlacement,
    /// Feed-forward flavour.
    #[serde(default)]
    pub feed_forward: FeedForwardKind,
    /// Attention backend.
    #[serde(default)]
    pub attn_implementation: AttentionImpl,
    /// Add an encoder-decoder attention block to each layer.
    #[serde(default)]
    pub add_cross_attention: bool,
}

fn default_rope_theta() -> f64 {
    10000.0
}

fn default_partial_rotary_factor() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_norm_eps() -> f64 {
    1e-5
}

impl AttentionConfig {
    /// Calculate head dimension.
    pub fn head_dim(&self) -> usize {
        if self.head_dim > 0 {
            self.head_dim
        } else {
            self.hidden_size / self.num_attention_heads.max(1)
        }
    }

    /// Get GQA ratio.
    pub fn gqa_ratio(&self) -> usize {
        self.num_attention_heads / self.num_key_value_heads.max(1)
    }

    /// Number of rotated features per head (even, at most `head_dim`).
    pub fn rotary_dim(&self) -> usize {
        let dim = (self.head_dim() as f64 * self.partial_rotary_factor) as usize;
        dim - dim % 2
    }

    /// Width of the query projection.
    pub fn q_dim(&self) -> usize {
        self.num_attention_heads * self.head_dim()
    }

    /// Width of each of the key/value projections.
    pub fn kv_dim(&self) -> usize {
        self.num_key_value_heads * self.head_dim()
    }

    /// Check the structural invariants every constructor relies on.
    pub fn validate(&self) -> Result<()> {
        if self.num_attention_heads == 0 || self.num_key_value_heads == 0 {
            return Err(TesseraError::Config(
                "num_attention_heads and num_key_value_heads must be positive".to_string(),
            ));
        }
        if self.head_dim == 0 && self.hidden_size % self.num_attention_heads != 0 {
            return Err(TesseraError::Config(format!(
                "hidden_size must be divisible by num_heads (got `hidden_size`: {} and `num_heads`: {})",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.num_attention_heads % self.num_key_value_heads != 0 {
            return Err(TesseraError::Config(format!(
                "num_attention_heads ({}) must be a multiple of num_key_value_heads ({})",
                self.num_attention_heads, self.num_key_value_heads
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(TesseraError::Config(format!(
                "head_dim must be even, got {}",
                self.head_dim()
            )));
        }
        if self.use_rotary {
            if !(0.0..=1.0).contains(&self.partial_rotary_factor) || self.rotary_dim() == 0 {
                return Err(TesseraError::Config(format!(
                    "partial_rotary_factor {} leaves no rotary features for head_dim {}",
                    self.partial_rotary_factor,
                    self.head_dim()
                )));
            }
            if let Some(scaling) = &self.rope_scaling {
                scaling.validate().map_err(TesseraError::Config)?;
            }
        }
        for (name, p) in [
            ("attention_dropout", self.attention_dropout),
            ("layerdrop", self.layerdrop),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(TesseraError::Config(format!(
                    "{name} must be in [0, 1), got {p}"
                )));
            }
        }
        Ok(())
    }

    /// Load from JSON file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Parse and validate a JSON config.
    pub fn from_json(json: &str) -> Result<Self> {
        // Bad field values are config errors; malformed JSON stays a serde error.
        let config: Self = serde_json::from_str(json).map_err(|e| {
            if e.is_data() {
                TesseraError::Config(e.to_string())
            } else {
                TesseraError::from(e)
            }
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Small Llama-style config for tests and benchmarks.
    pub fn tiny(
        hidden_size: usize,
        num_attention_heads: usize,
        num_key_value_heads: usize,
    ) -> Self {
        Self {
            hidden_size,
            intermediate_size: hidden_size * 2,
            num_attention_heads,
            num_key_value_heads,
            num_hidden_layers: 2,
            head_dim: 0,
            max_position_embeddings: 128,
            ..Self::default()
        }
    }
}

impl Default for AttentionConfig {
    fn default() -> Self {
        // Llama-3-8B-like defaults
        Self {
            hidden_size: 4096,
            intermediate_size: 14336,
            num_attention_heads: 32,
            num_key_value_heads: 8,
            num_hidden_layers: 32,
            head_dim: 128,
            max_position_embeddings: 8192,
            rope_theta: 500000.0,
            rope_scaling: None,
            partial_rotary_factor: 1.0,
            use_rotary: true,
            attention_dropout: 0.0,
            layerdrop: 0.0,
            attention_bias: false,
            norm_eps: 1e-5,
            norm_kind: NormKind::Rms,
            norm_placement: NormPlacement::Pre,
            feed_forward: FeedForwardKind::SwiGlu,
            attn_implementation: AttentionImpl::Eager,
            add_cross_attention: false,
        }
    }
}
