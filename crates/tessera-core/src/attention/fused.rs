//! Fused attention: online softmax over key tiles.
//!
//! The full probability matrix is never materialized. Each key tile updates a
//! running row maximum `m`, a running normalizer `l` and an unnormalized
//! accumulator `acc`:
//!
//! ```text
//! m' = max(m, rowmax(s))
//! l' = l * exp(m - m') + rowsum(exp(s - m'))
//! acc' = acc * exp(m - m') + exp(s - m') @ v
//! ```
//!
//! With the `cuda` feature, CUDA tensors without an explicit mask go through
//! the flash-attention kernel instead.

use super::backend::{causal_bias, check_operands, repeat_kv, slice_mask};
use super::{AttentionBackend, AttentionImpl, ScoreContext};
use crate::error::Result;
use crate::mask::min_value;
use candle_core::{DType, Tensor, D};

/// Default number of keys per tile.
pub const DEFAULT_TILE: usize = 64;

/// Tiled online-softmax backend.
#[derive(Debug, Clone, Copy)]
pub struct FusedBackend {
    /// Keys per tile.
    tile: usize,
}

impl FusedBackend {
    /// Create a backend processing `tile` keys at a time.
    pub fn new(tile: usize) -> Self {
        Self { tile: tile.max(1) }
    }

    /// Keys per tile.
    pub fn tile(&self) -> usize {
        self.tile
    }

    fn online_softmax(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
        ctx: &ScoreContext,
    ) -> Result<Tensor> {
        let (batch, heads, query_len, key_len, head_dim) = check_operands(query, key, value, ctx)?;
        let device = query.device();

        let key = repeat_kv(key, ctx.n_rep)?.to_dtype(DType::F32)?;
        let value = repeat_kv(value, ctx.n_rep)?.to_dtype(DType::F32)?;
        let query = (query.to_dtype(DType::F32)? * ctx.scale)?.contiguous()?;
        let mask = mask
            .map(|m| slice_mask(m, batch, query_len, key_len))
            .transpose()?;
        let dropout = ctx.effective_dropout();

        let stats = (batch, heads, query_len, 1);
        let mut row_max = Tensor::full(min_value(DType::F32) as f32, stats, device)?;
        let mut row_sum = Tensor::zeros(stats, DType::F32, device)?;
        let mut acc = Tensor::zeros((batch, heads, query_len, head_dim), DType::F32, device)?;

        let mut start = 0;
        while start < key_len {
            let cols = self.tile.min(key_len - start);
            let k_tile = key.narrow(2, start, cols)?.contiguous()?;
            let v_tile = value.narrow(2, start, cols)?.contiguous()?;

            let mut scores = query.matmul(&k_tile.t()?)?;
            if let Some(mask) = &mask {
                scores = scores.broadcast_add(&mask.narrow(3, start, cols)?)?;
            } else if ctx.is_causal && query_len > 1 {
                scores = scores.broadcast_add(&causal_bias(query_len, key_len, start, cols, device)?)?;
            }

            let new_max = row_max.maximum(&scores.max_keepdim(D::Minus1)?)?;
            let correction = (&row_max - &new_max)?.exp()?;
            let p = scores.broadcast_sub(&new_max)?.exp()?;

            row_sum = (row_sum.mul(&correction)? + p.sum_keepdim(D::Minus1)?)?;
            let p = if dropout > 0.0 {
                candle_nn::ops::dropout(&p, dropout)?
            } else {
                p
            };
            acc = (acc.broadcast_mul(&correction)? + p.matmul(&v_tile)?)?;
            row_max = new_max;
            start += cols;
        }

        Ok(acc.broadcast_div(&row_sum)?)
    }
}

impl Default for FusedBackend {
    fn default() -> Self {
        Self::new(DEFAULT_TILE)
    }
}

impl AttentionBackend for FusedBackend {
    fn kind(&self) -> AttentionImpl {
        AttentionImpl::Fused
    }

    fn score_and_combine(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
        ctx: &ScoreContext,
    ) -> Result<(Tensor, Option<Tensor>)> {
        #[cfg(feature = "cuda")]
        if let Some(output) = flash::try_flash(query, key, value, mask, ctx)? {
            return Ok((output, None));
        }

        let output = self.online_softmax(query, key, value, mask, ctx)?;
        Ok((output.to_dtype(query.dtype())?, None))
    }
}

#[cfg(feature = "cuda")]
mod flash {
    use super::ScoreContext;
    use crate::error::Result;
    use candle_core::{DType, Tensor};

    /// Run flash-attention when the operands allow it.
    ///
    /// The kernel handles grouped heads natively and aligns its causal mask to
    /// the bottom-right corner. It has no additive-mask or dropout input.
    pub(super) fn try_flash(
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
        ctx: &ScoreContext,
    ) -> Result<Option<Tensor>> {
        let eligible = query.device().is_cuda()
            && mask.is_none()
            && ctx.effective_dropout() == 0.0
            && matches!(query.dtype(), DType::F16 | DType::BF16);
        if !eligible {
            return Ok(None);
        }

        tracing::trace!("dispatching to flash-attention kernel");

        // Flash attention expects [batch, seq_len, num_heads, head_dim]
        let q = query.transpose(1, 2)?.contiguous()?;
        let k = key.transpose(1, 2)?.contiguous()?;
        let v = value.transpose(1, 2)?.contiguous()?;

        let causal = ctx.is_causal && q.dim(1)? > 1;
        let output = candle_flash_attn::flash_attn(&q, &k, &v, ctx.scale as f32, causal)?;

        Ok(Some(output.transpose(1, 2)?.contiguous()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attention::EagerBackend;
    use candle_core::Device;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b).unwrap().abs().unwrap().max_all().unwrap().to_scalar().unwrap()
    }

    #[test]
    fn matches_eager_across_tiles() {
        let q = Tensor::randn(0.0f32, 1.0, &[2, 4, 7, 8], &Device::Cpu).unwrap();
        let k = Tensor::randn(0.0f32, 1.0, &[2, 2, 7, 8], &Device::Cpu).unwrap();
        let v = Tensor::randn(0.0f32, 1.0, &[2, 2, 7, 8], &Device::Cpu).unwrap();
        let ctx = ScoreContext::new(8, 2);

        let (expected, _) = EagerBackend.score_and_combine(&q, &k, &v, None, &ctx).unwrap();
        for tile in [1, 3, 7, 64] {
            let (actual, weights) = FusedBackend::new(tile)
                .score_and_combine(&q, &k, &v, None, &ctx)
                .unwrap();
            assert!(weights.is_none());
            assert!(max_abs_diff(&expected, &actual) < 1e-5, "tile {tile}");
        }
    }

    #[test]
    fn matches_eager_with_mask_over_cache() {
        // Two new queries over six keys, first key padded.
        let q = Tensor::randn(0.0f32, 1.0, &[1, 2, 2, 4], &Device::Cpu).unwrap();
        let k = Tensor::randn(0.0f32, 1.0, &[1, 2, 6, 4], &Device::Cpu).unwrap();
        let v = Tensor::randn(0.0f32, 1.0, &[1, 2, 6, 4], &Device::Cpu).unwrap();
        let padding = Tensor::new(&[[0u8, 1, 1, 1, 1, 1]], &Device::Cpu).unwrap();
        let mask = crate::mask::AttentionMaskBuilder::new(DType::F32, &Device::Cpu)
            .unwrap()
            .build(Some(&padding), 2, 6, 4, true)
            .unwrap()
            .unwrap();
        let ctx = ScoreContext::new(4, 1);

        let (expected, _) = EagerBackend
            .score_and_combine(&q, &k, &v, Some(&mask), &ctx)
            .unwrap();
        let (actual, _) = FusedBackend::new(4)
            .score_and_combine(&q, &k, &v, Some(&mask), &ctx)
            .unwrap();
        assert!(max_abs_diff(&expected, &actual) < 1e-5);
    }

    #[test]
    fn leading_masked_tile_does_not_leak() {
        // Whole first tile masked for the only query.
        let q = Tensor::randn(0.0f32, 1.0, &[1, 1, 1, 4], &Device::Cpu).unwrap();
        let k = Tensor::randn(0.0f32, 1.0, &[1, 1, 4, 4], &Device::Cpu).unwrap();
        let v = Tensor::randn(0.0f32, 1.0, &[1, 1, 4, 4], &Device::Cpu).unwrap();
        let mask = Tensor::new(&[f32::MIN, f32::MIN, 0.0, 0.0], &Device::Cpu)
            .unwrap()
            .reshape((1, 1, 1, 4))
            .unwrap();
        let ctx = ScoreContext::new(4, 1);

        let (expected, _) = EagerBackend
            .score_and_combine(&q, &k, &v, Some(&mask), &ctx)
            .unwrap();
        let (actual, _) = FusedBackend::new(2)
            .score_and_combine(&q, &k, &v, Some(&mask), &ctx)
            .unwrap();
        assert!(max_abs_diff(&expected, &actual) < 1e-5);
    }

    #[test]
    fn never_returns_weights() {
        let q = Tensor::randn(0.0f32, 1.0, &[1, 1, 2, 4], &Device::Cpu).unwrap();
        let ctx = ScoreContext {
            output_attentions: true,
            ..ScoreContext::new(4, 1)
        };
        let (_, weights) = FusedBackend::default()
            .score_and_combine(&q, &q, &q, None, &ctx)
            .unwrap();
        assert!(weights.is_none());
    }
}
