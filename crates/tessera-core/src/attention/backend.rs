//! Attention backend trait and backend selection.
//!
//! This module provides:
//! - [`AttentionImpl`] - Closed set of backends, chosen by configuration
//! - [`AttentionBackend`] - Trait implemented by every backend
//! - [`ScoreContext`] - Per-call scoring parameters
//! - [`repeat_kv`] - Grouped-query head expansion

use super::{EagerBackend, FusedBackend, SdpaBackend};
use crate::cache::CacheMode;
use crate::error::{Result, TesseraError};
use crate::mask::min_value;
use candle_core::{DType, Device, Tensor};
use std::fmt;
use std::str::FromStr;

/// Attention implementation selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AttentionImpl {
    /// Explicit matmul + softmax. The only backend that returns weights.
    #[default]
    Eager,
    /// Tiled online-softmax kernel; flash-attention on CUDA.
    Fused,
    /// Scaled-dot-product dispatch onto the fused softmax primitive.
    ScaledDotProduct,
}

impl AttentionImpl {
    /// Canonical configuration name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Eager => "eager",
            Self::Fused => "flash_attention_2",
            Self::ScaledDotProduct => "sdpa",
        }
    }

    /// Instantiate the backend.
    pub fn backend(&self) -> Box<dyn AttentionBackend> {
        match self {
            Self::Eager => Box::new(EagerBackend),
            Self::Fused => Box::new(FusedBackend::default()),
            Self::ScaledDotProduct => Box::new(SdpaBackend),
        }
    }

    /// Whether the backend can enforce causality without an explicit mask.
    pub fn supports_implicit_causal(&self) -> bool {
        !matches!(self, Self::Eager)
    }

    /// Whether the backend can return attention weights.
    pub fn returns_weights(&self) -> bool {
        matches!(self, Self::Eager)
    }

    /// Reject backend/cache combinations the backend cannot serve.
    pub fn check_cache(&self, mode: CacheMode) -> Result<()> {
        match (self, mode) {
            (Self::Fused, CacheMode::Static { .. }) => Err(TesseraError::Config(
                "the fused attention backend does not support a static cache; \
                 use an append cache or the sdpa backend"
                    .to_string(),
            )),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for AttentionImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AttentionImpl {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "eager" => Ok(Self::Eager),
            "flash_attention_2" | "fused" => Ok(Self::Fused),
            "sdpa" => Ok(Self::ScaledDotProduct),
            other => Err(TesseraError::Config(format!(
                "unknown attention implementation `{other}` (expected eager, flash_attention_2, fused or sdpa)"
            ))),
        }
    }
}

impl serde::Serialize for AttentionImpl {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> serde::Deserialize<'de> for AttentionImpl {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

/// Per-call scoring parameters shared by all backends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreContext {
    /// Multiplier applied to `q · kᵗ`.
    pub scale: f64,
    /// Query heads per key/value head.
    pub n_rep: usize,
    /// Enforce causality when no explicit mask is given. Query `i` then sees
    /// keys `j <= (key_len - query_len) + i`.
    pub is_causal: bool,
    /// Attention dropout probability.
    pub dropout: f32,
    /// Training mode; dropout only applies here.
    pub training: bool,
    /// Return the attention probabilities.
    pub output_attentions: bool,
}

impl ScoreContext {
    /// Context for inference with the standard `1/sqrt(head_dim)` scale.
    pub fn new(head_dim: usize, n_rep: usize) -> Self {
        Self {
            scale: 1.0 / (head_dim as f64).sqrt(),
            n_rep,
            is_causal: true,
            dropout: 0.0,
            training: false,
            output_attentions: false,
        }
    }

    /// Dropout probability actually in effect.
    pub fn effective_dropout(&self) -> f32 {
        if self.training {
            self.dropout
        } else {
            0.0
        }
    }
}

/// Scoring strategy: steps from key/value expansion to the weighted sum of values.
///
/// Inputs are `query` [batch, heads, q_len, head_dim] and `key`/`value`
/// [batch, kv_heads, k_len, head_dim]. The optional mask is an additive bias
/// [batch | 1, 1, q_len, >= k_len]. Returns the attention output
/// [batch, heads, q_len, head_dim] in the query dtype and, when requested and
/// supported, the probabilities [batch, heads, q_len, k_len].
pub trait AttentionBackend: Send + Sync + fmt::Debug {
    /// Which implementation this is.
    fn kind(&self) -> AttentionImpl;

    /// Score queries against keys and combine values.
    fn score_and_combine(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
        ctx: &ScoreContext,
    ) -> Result<(Tensor, Option<Tensor>)>;
}

/// Expand key/value heads for grouped-query attention.
///
/// `[batch, kv_heads, seq, dim] -> [batch, kv_heads * n_rep, seq, dim]`, each
/// head repeated `n_rep` times in place (head `h` of the output reads kv head
/// `h / n_rep`).
pub fn repeat_kv(x: &Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x.clone());
    }
    let (batch, kv_heads, seq_len, head_dim) = x.dims4()?;
    Ok(x
        .unsqueeze(2)?
        .broadcast_as((batch, kv_heads, n_rep, seq_len, head_dim))?
        .reshape((batch, kv_heads * n_rep, seq_len, head_dim))?)
}

/// Validate an additive mask and cut it to `key_len` columns, as f32.
pub(crate) fn slice_mask(
    mask: &Tensor,
    batch: usize,
    query_len: usize,
    key_len: usize,
) -> Result<Tensor> {
    let (mask_batch, heads, mask_q, mask_k) = mask.dims4()?;
    if (mask_batch != batch && mask_batch != 1) || heads != 1 || mask_q != query_len || mask_k < key_len {
        return Err(TesseraError::shape(
            "attention mask",
            &[batch, 1, query_len, key_len],
            mask.dims(),
        ));
    }
    Ok(mask.narrow(3, 0, key_len)?.to_dtype(DType::F32)?)
}

/// Bottom-right aligned causal bias for key columns `start..start + cols`:
/// [query_len, cols] f32.
pub(crate) fn causal_bias(
    query_len: usize,
    key_len: usize,
    start: usize,
    cols: usize,
    device: &Device,
) -> Result<Tensor> {
    let shift = key_len.saturating_sub(query_len);
    let min = min_value(DType::F32) as f32;
    let data: Vec<f32> = (0..query_len)
        .flat_map(|i| {
            (start..start + cols).map(move |j| if j > shift + i { min } else { 0.0 })
        })
        .collect();
    Ok(Tensor::from_vec(data, (query_len, cols), device)?)
}

/// Check query/key/value ranks and head grouping before scoring.
pub(crate) fn check_operands(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    ctx: &ScoreContext,
) -> Result<(usize, usize, usize, usize, usize)> {
    let (batch, heads, query_len, head_dim) = query.dims4()?;
    let (_, kv_heads, key_len, _) = key.dims4()?;
    crate::error::check_shape(
        "attention key",
        &[batch, heads / ctx.n_rep.max(1), key_len, head_dim],
        key.dims(),
    )?;
    crate::error::check_shape("attention value", key.dims(), value.dims())?;
    if kv_heads * ctx.n_rep != heads {
        return Err(TesseraError::shape(
            "grouped key/value heads",
            &[heads],
            &[kv_heads * ctx.n_rep],
        ));
    }
    Ok((batch, heads, query_len, key_len, head_dim))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parse_backend_names() {
        assert_eq!("eager".parse::<AttentionImpl>().unwrap(), AttentionImpl::Eager);
        assert_eq!(
            "flash_attention_2".parse::<AttentionImpl>().unwrap(),
            AttentionImpl::Fused
        );
        assert_eq!("fused".parse::<AttentionImpl>().unwrap(), AttentionImpl::Fused);
        assert_eq!(
            "sdpa".parse::<AttentionImpl>().unwrap(),
            AttentionImpl::ScaledDotProduct
        );
        let err = "flex_attention".parse::<AttentionImpl>().unwrap_err();
        assert!(matches!(err, TesseraError::Config(_)));
    }

    #[test]
    fn serde_uses_canonical_names() {
        let json = serde_json::to_string(&AttentionImpl::Fused).unwrap();
        assert_eq!(json, "\"flash_attention_2\"");
        let back: AttentionImpl = serde_json::from_str(&json).unwrap();
        assert_eq!(back, AttentionImpl::Fused);
        assert!(serde_json::from_str::<AttentionImpl>("\"paged\"").is_err());
    }

    #[test]
    fn backend_kinds_match() {
        for kind in [
            AttentionImpl::Eager,
            AttentionImpl::Fused,
            AttentionImpl::ScaledDotProduct,
        ] {
            assert_eq!(kind.backend().kind(), kind);
        }
    }

    #[test]
    fn fused_rejects_static_cache() {
        let static_mode = CacheMode::Static { max_len: 16 };
        assert!(AttentionImpl::Fused.check_cache(static_mode).is_err());
        assert!(AttentionImpl::Fused.check_cache(CacheMode::Append).is_ok());
        assert!(AttentionImpl::ScaledDotProduct.check_cache(static_mode).is_ok());
        assert!(AttentionImpl::Eager.check_cache(static_mode).is_ok());
    }

    #[test]
    fn repeat_kv_identity() {
        let x = Tensor::randn(0.0f32, 1.0, &[2, 3, 4, 5], &Device::Cpu).unwrap();
        let y = repeat_kv(&x, 1).unwrap();
        assert_eq!(x.id(), y.id());
    }

    #[test]
    fn repeat_kv_interleaves() {
        // Two kv heads with constant values 0 and 1.
        let x = Tensor::new(&[0.0f32, 1.0], &Device::Cpu)
            .unwrap()
            .reshape((1, 2, 1, 1))
            .unwrap();
        let y: Vec<f32> = repeat_kv(&x, 3).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(y, vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn causal_bias_alignment() {
        // Two queries at the end of five keys.
        let bias: Vec<Vec<f32>> = causal_bias(2, 5, 0, 5, &Device::Cpu)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(bias[0][3], 0.0);
        assert_eq!(bias[0][4], f32::MIN);
        assert!(bias[1].iter().all(|&v| v == 0.0));

        // Tile covering columns 2..4 of a square block.
        let tile: Vec<Vec<f32>> = causal_bias(4, 4, 2, 2, &Device::Cpu)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(tile[1], vec![f32::MIN, f32::MIN]);
        assert_eq!(tile[2], vec![0.0, f32::MIN]);
    }

    #[test]
    fn slice_mask_checks_shape() {
        let mask = Tensor::zeros((1, 1, 3, 8), DType::F32, &Device::Cpu).unwrap();
        let sliced = slice_mask(&mask, 2, 3, 5).unwrap();
        assert_eq!(sliced.dims(), &[1, 1, 3, 5]);

        assert!(slice_mask(&mask, 2, 4, 5).is_err());
        assert!(slice_mask(&mask, 2, 3, 9).is_err());
    }

    proptest! {
        #[test]
        fn repeat_kv_groups_share_heads(kv_heads in 1usize..4, n_rep in 1usize..4) {
            let x = Tensor::randn(0.0f32, 1.0, &[1, kv_heads, 3, 2], &Device::Cpu).unwrap();
            let y = repeat_kv(&x, n_rep).unwrap();
            prop_assert_eq!(y.dims(), &[1, kv_heads * n_rep, 3, 2]);
            for h in 0..kv_heads * n_rep {
                let expected: Vec<f32> = x.narrow(1, h / n_rep, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
                let actual: Vec<f32> = y.narrow(1, h, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
                prop_assert_eq!(expected, actual);
            }
        }
    }
}
