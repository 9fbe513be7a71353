//! Rotary scaling policies and their inverse-frequency derivations.
//!
//! Every policy is evaluated in `f64` and only narrowed to `f32` when the
//! frequency vector is handed back, so long contexts do not accumulate
//! rounding error in the rotation angles.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Scaling policy applied to the rotary inverse frequencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRopeScaling", into = "RawRopeScaling")]
pub enum RopeScaling {
    /// Plain `base^(-2i/dim)` frequencies.
    Default,
    /// Position interpolation: frequencies divided by `factor`.
    Linear {
        /// Interpolation factor (>= 1).
        factor: f64,
    },
    /// Dynamic NTK: the base is stretched once the sequence outgrows the
    /// training length.
    Dynamic {
        /// Scaling factor (>= 1).
        factor: f64,
    },
    /// YaRN: ramp blend of interpolated and extrapolated frequencies plus an
    /// attention temperature.
    Yarn {
        /// Context extension factor (>= 1).
        factor: f64,
        /// Rotation count bounding the extrapolated band.
        beta_fast: f64,
        /// Rotation count bounding the interpolated band.
        beta_slow: f64,
        /// Explicit attention scaling; derived from `factor` when absent.
        attention_factor: Option<f64>,
        /// Training length; the model's `max_position_embeddings` when absent.
        original_max_position_embeddings: Option<usize>,
    },
    /// Wavelength-banded scaling used by Llama 3.1 checkpoints.
    Llama3 {
        /// Scaling factor for the low-frequency band.
        factor: f64,
        /// Lower wavelength threshold factor.
        low_freq_factor: f64,
        /// Upper wavelength threshold factor.
        high_freq_factor: f64,
        /// Training length.
        original_max_position_embeddings: usize,
    },
}

impl Default for RopeScaling {
    fn default() -> Self {
        Self::Default
    }
}

impl RopeScaling {
    /// Name of the policy as it appears in configuration files.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Linear { .. } => "linear",
            Self::Dynamic { .. } => "dynamic",
            Self::Yarn { .. } => "yarn",
            Self::Llama3 { .. } => "llama3",
        }
    }

    /// Whether the frequencies depend on the requested sequence length.
    pub fn is_dynamic(&self) -> bool {
        matches!(self, Self::Dynamic { .. })
    }

    /// Scaling factor, 1.0 for the default policy.
    pub fn factor(&self) -> f64 {
        match self {
            Self::Default => 1.0,
            Self::Linear { factor }
            | Self::Dynamic { factor }
            | Self::Yarn { factor, .. }
            | Self::Llama3 { factor, .. } => *factor,
        }
    }

    /// Reject factors that would shrink the usable context.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let factor = self.factor();
        if !factor.is_finite() || factor < 1.0 {
            return Err(format!(
                "rope scaling `{}` requires factor >= 1, got {factor}",
                self.name()
            ));
        }
        if let Self::Llama3 {
            low_freq_factor,
            high_freq_factor,
            ..
        } = self
        {
            if high_freq_factor <= low_freq_factor {
                return Err(format!(
                    "llama3 rope scaling requires high_freq_factor > low_freq_factor, got {high_freq_factor} <= {low_freq_factor}"
                ));
            }
        }
        Ok(())
    }
}

/// Compute `(inv_freq, attention_scaling)` for `dim` rotary features.
///
/// `seq_len` is only consulted by the dynamic policy; `original_max` is the
/// model's training length.
pub fn compute_inv_freq(
    dim: usize,
    base: f64,
    scaling: &RopeScaling,
    seq_len: usize,
    original_max: usize,
) -> (Vec<f32>, f32) {
    match scaling {
        RopeScaling::Default => (base_inv_freq(dim, base), 1.0),
        RopeScaling::Linear { factor } => {
            let inv_freq = base_inv_freq_f64(dim, base)
                .into_iter()
                .map(|f| (f / factor) as f32)
                .collect();
            (inv_freq, 1.0)
        }
        RopeScaling::Dynamic { factor } => {
            let seq_len = seq_len.max(original_max) as f64;
            let dim_f = dim as f64;
            let base = base
                * ((factor * seq_len / original_max as f64) - (factor - 1.0))
                    .powf(dim_f / (dim_f - 2.0));
            (base_inv_freq(dim, base), 1.0)
        }
        RopeScaling::Yarn {
            factor,
            beta_fast,
            beta_slow,
            attention_factor,
            original_max_position_embeddings,
        } => {
            let original = original_max_position_embeddings.unwrap_or(original_max);
            let inv_freq = yarn_inv_freq(dim, base, *factor, *beta_fast, *beta_slow, original);
            let scaling = attention_factor.unwrap_or_else(|| yarn_mscale(*factor));
            (inv_freq, scaling as f32)
        }
        RopeScaling::Llama3 {
            factor,
            low_freq_factor,
            high_freq_factor,
            original_max_position_embeddings,
        } => {
            let original = *original_max_position_embeddings as f64;
            let low_freq_wavelen = original / low_freq_factor;
            let high_freq_wavelen = original / high_freq_factor;
            let inv_freq = base_inv_freq_f64(dim, base)
                .into_iter()
                .map(|freq| {
                    let wavelen = 2.0 * PI / freq;
                    let scaled = if wavelen < high_freq_wavelen {
                        freq
                    } else if wavelen > low_freq_wavelen {
                        freq / factor
                    } else {
                        let smooth = (original / wavelen - low_freq_factor)
                            / (high_freq_factor - low_freq_factor);
                        (1.0 - smooth) * freq / factor + smooth * freq
                    };
                    scaled as f32
                })
                .collect();
            (inv_freq, 1.0)
        }
    }
}

fn base_inv_freq_f64(dim: usize, base: f64) -> Vec<f64> {
    (0..dim / 2)
        .map(|i| 1.0 / base.powf(2.0 * i as f64 / dim as f64))
        .collect()
}

fn base_inv_freq(dim: usize, base: f64) -> Vec<f32> {
    base_inv_freq_f64(dim, base)
        .into_iter()
        .map(|f| f as f32)
        .collect()
}

fn yarn_mscale(factor: f64) -> f64 {
    if factor <= 1.0 {
        1.0
    } else {
        0.1 * factor.ln() + 1.0
    }
}

/// Dimension index at which a frequency completes `num_rotations` turns over
/// the training length.
fn yarn_correction_dim(num_rotations: f64, dim: usize, base: f64, original: usize) -> f64 {
    (dim as f64 * (original as f64 / (num_rotations * 2.0 * PI)).ln()) / (2.0 * base.ln())
}

fn yarn_inv_freq(
    dim: usize,
    base: f64,
    factor: f64,
    beta_fast: f64,
    beta_slow: f64,
    original: usize,
) -> Vec<f32> {
    let low = yarn_correction_dim(beta_fast, dim, base, original)
        .floor()
        .max(0.0);
    let high = yarn_correction_dim(beta_slow, dim, base, original)
        .ceil()
        .min(dim as f64 - 1.0);
    // Degenerate range would divide by zero in the ramp.
    let high = if (high - low).abs() < f64::EPSILON {
        high + 0.001
    } else {
        high
    };

    base_inv_freq_f64(dim, base)
        .into_iter()
        .enumerate()
        .map(|(i, extrapolation)| {
            let interpolation = extrapolation / factor;
            let ramp = ((i as f64 - low) / (high - low)).clamp(0.0, 1.0);
            let extrapolation_weight = 1.0 - ramp;
            let freq = interpolation * (1.0 - extrapolation_weight)
                + extrapolation * extrapolation_weight;
            freq as f32
        })
        .collect()
}

/// Wire form of [`RopeScaling`]; accepts both `rope_type` and the legacy `type` key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawRopeScaling {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rope_type: Option<String>,
    #[serde(default, rename = "type", skip_serializing)]
    legacy_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    factor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    beta_fast: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    beta_slow: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    attention_factor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    low_freq_factor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    high_freq_factor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    original_max_position_embeddings: Option<usize>,
}

impl TryFrom<RawRopeScaling> for RopeScaling {
    type Error = String;

    fn try_from(raw: RawRopeScaling) -> std::result::Result<Self, Self::Error> {
        let kind = raw
            .rope_type
            .clone()
            .or_else(|| raw.legacy_type.clone())
            .unwrap_or_else(|| "default".to_string());
        let factor = || {
            raw.factor
                .ok_or_else(|| format!("rope scaling `{kind}` requires `factor`"))
        };

        let scaling = match kind.as_str() {
            "default" => Self::Default,
            "linear" => Self::Linear { factor: factor()? },
            "dynamic" => Self::Dynamic { factor: factor()? },
            "yarn" => Self::Yarn {
                factor: factor()?,
                beta_fast: raw.beta_fast.unwrap_or(32.0),
                beta_slow: raw.beta_slow.unwrap_or(1.0),
                attention_factor: raw.attention_factor,
                original_max_position_embeddings: raw.original_max_position_embeddings,
            },
            "llama3" => Self::Llama3 {
                factor: factor()?,
                low_freq_factor: raw.low_freq_factor.unwrap_or(1.0),
                high_freq_factor: raw.high_freq_factor.unwrap_or(4.0),
                original_max_position_embeddings: raw
                    .original_max_position_embeddings
                    .ok_or("llama3 rope scaling requires `original_max_position_embeddings`")?,
            },
            other => return Err(format!("unknown rope scaling type `{other}`")),
        };
        scaling.validate()?;
        Ok(scaling)
    }
}

impl From<RopeScaling> for RawRopeScaling {
    fn from(scaling: RopeScaling) -> Self {
        let mut raw = RawRopeScaling {
            rope_type: Some(scaling.name().to_string()),
            ..Default::default()
        };
        match scaling {
            RopeScaling::Default => {}
            RopeScaling::Linear { factor } | RopeScaling::Dynamic { factor } => {
                raw.factor = Some(factor);
            }
            RopeScaling::Yarn {
                factor,
                beta_fast,
                beta_slow,
                attention_factor,
                original_max_position_embeddings,
            } => {
                raw.factor = Some(factor);
                raw.beta_fast = Some(beta_fast);
                raw.beta_slow = Some(beta_slow);
                raw.attention_factor = attention_factor;
                raw.original_max_position_embeddings = original_max_position_embeddings;
            }
            RopeScaling::Llama3 {
                factor,
                low_freq_factor,
                high_freq_factor,
                original_max_position_embeddings,
            } => {
                raw.factor = Some(factor);
                raw.low_freq_factor = Some(low_freq_factor);
                raw.high_freq_factor = Some(high_freq_factor);
                raw.original_max_position_embeddings = Some(original_max_position_embeddings);
            }
        }
        raw
    }
}
