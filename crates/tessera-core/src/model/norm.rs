//! Normalization layers.
//!
//! # Formulas
//!
//! `RMSNorm(x) = x * weight / sqrt(mean(x^2) + eps)`
//!
//! `LayerNorm(x) = (x - mean(x)) / sqrt(var(x) + eps) * weight + bias`
//!
//! Statistics are computed in f32 and the result cast back to the input dtype.
//!
//! # Reference
//!
//! [Root Mean Square Layer Normalization](https://arxiv.org/abs/1910.07467)

use super::NormKind;
use crate::error::{check_shape, Result};
use candle_core::{DType, Device, Tensor, D};

/// RMS Layer Normalization.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    /// Learnable scale parameter.
    weight: Tensor,
    /// Small constant for numerical stability.
    eps: f64,
}

impl RmsNorm {
    /// Create a new RMSNorm layer with given weight.
    pub fn new(weight: Tensor, eps: f64) -> Self {
        Self { weight, eps }
    }

    /// Forward pass over the last dimension.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;

        // 1/sqrt(mean(x^2) + eps)
        let mean_sq = x.sqr()?.mean_keepdim(D::Minus1)?;
        let rsqrt = (mean_sq + self.eps)?.sqrt()?.recip()?;

        let normalized = x.broadcast_mul(&rsqrt)?.to_dtype(dtype)?;
        Ok(normalized.broadcast_mul(&self.weight)?)
    }
}

/// Mean/variance layer normalization with bias.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    /// Create a new LayerNorm with given weight and bias.
    pub fn new(weight: Tensor, bias: Tensor, eps: f64) -> Result<Self> {
        check_shape("layer norm bias", weight.dims(), bias.dims())?;
        Ok(Self { weight, bias, eps })
    }

    /// Forward pass over the last dimension.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;

        let centered = x.broadcast_sub(&x.mean_keepdim(D::Minus1)?)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normalized = centered
            .broadcast_div(&(var + self.eps)?.sqrt()?)?
            .to_dtype(dtype)?;

        Ok(normalized
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)?)
    }
}

/// Normalization used around the attention and feed-forward blocks.
#[derive(Debug, Clone)]
pub enum Norm {
    /// RMSNorm.
    Rms(RmsNorm),
    /// LayerNorm.
    Layer(LayerNorm),
}

impl Norm {
    /// Identity-initialized norm (unit weight, zero bias).
    pub fn ones(
        kind: NormKind,
        hidden_size: usize,
        eps: f64,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let weight = Tensor::ones(hidden_size, dtype, device)?;
        Ok(match kind {
            NormKind::Rms => Self::Rms(RmsNorm::new(weight, eps)),
            NormKind::Layer => {
                let bias = Tensor::zeros(hidden_size, dtype, device)?;
                Self::Layer(LayerNorm::new(weight, bias, eps)?)
            }
        })
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [..., hidden_size]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Rms(norm) => norm.forward(x),
            Self::Layer(norm) => norm.forward(x),
        }
    }

    /// Which flavour this is.
    pub fn kind(&self) -> NormKind {
        match self {
            Self::Rms(_) => NormKind::Rms,
            Self::Layer(_) => NormKind::Layer,
        }
    }
}
