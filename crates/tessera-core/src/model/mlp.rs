//! Feed-forward blocks.
//!
//! - SwiGLU: `down(silu(gate(x)) * up(x))`, no bias (Llama family)
//! - GELU: `fc2(gelu(fc1(x)))`, with bias (BART family)
//!
//! # Reference
//!
//! [GLU Variants Improve Transformer](https://arxiv.org/abs/2002.05202)

use super::{AttentionConfig, FeedForwardKind};
use crate::attention::random_linear;
use crate::error::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::ops::silu;
use candle_nn::{Linear, Module};

/// Feed-forward block of a decoder layer.
#[derive(Debug, Clone)]
pub enum FeedForward {
    /// Gated SiLU MLP.
    SwiGlu {
        /// Gate projection: hidden -> intermediate
        gate_proj: Linear,
        /// Up projection: hidden -> intermediate
        up_proj: Linear,
        /// Down projection: intermediate -> hidden
        down_proj: Linear,
    },
    /// Two-layer GELU MLP.
    Gelu {
        /// hidden -> intermediate
        fc1: Linear,
        /// intermediate -> hidden
        fc2: Linear,
    },
}

impl FeedForward {
    /// Create a block with random weights (for testing).
    pub fn random(config: &AttentionConfig, dtype: DType, device: &Device) -> Result<Self> {
        let hidden = config.hidden_size;
        let inter = config.intermediate_size;
        Ok(match config.feed_forward {
            FeedForwardKind::SwiGlu => Self::SwiGlu {
                gate_proj: random_linear(inter, hidden, false, dtype, device)?,
                up_proj: random_linear(inter, hidden, false, dtype, device)?,
                down_proj: random_linear(hidden, inter, false, dtype, device)?,
            },
            FeedForwardKind::Gelu => Self::Gelu {
                fc1: random_linear(inter, hidden, true, dtype, device)?,
                fc2: random_linear(hidden, inter, true, dtype, device)?,
            },
        })
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [..., hidden_size]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::SwiGlu {
                gate_proj,
                up_proj,
                down_proj,
            } => {
                let gate = silu(&gate_proj.forward(x)?)?;
                let up = up_proj.forward(x)?;
                Ok(down_proj.forward(&(gate * up)?)?)
            }
            Self::Gelu { fc1, fc2 } => Ok(fc2.forward(&fc1.forward(x)?.gelu_erf()?)?),
        }
    }

    /// Which flavour this is.
    pub fn kind(&self) -> FeedForwardKind {
        match self {
            Self::SwiGlu { .. } => FeedForwardKind::SwiGlu,
            Self::Gelu { .. } => FeedForwardKind::Gelu,
        }
    }
}
