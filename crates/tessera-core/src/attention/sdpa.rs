//! Scaled-dot-product dispatch.
//!
//! Picks one of three paths per call and runs it on the fused last-dim softmax
//! kernel:
//! - decode: a single query and no mask, nothing to hide
//! - implicit causal: no mask, causal bias generated in place
//! - explicit mask: the supplied additive bias

use super::backend::{causal_bias, check_operands, repeat_kv, slice_mask};
use super::{AttentionBackend, AttentionImpl, ScoreContext};
use crate::error::Result;
use candle_core::{DType, Tensor};

/// Scaled-dot-product attention backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct SdpaBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Path {
    Decode,
    ImplicitCausal,
    Explicit,
    Unmasked,
}

fn select_path(mask: Option<&Tensor>, query_len: usize, is_causal: bool) -> Path {
    match (mask, is_causal) {
        (Some(_), _) => Path::Explicit,
        (None, true) if query_len == 1 => Path::Decode,
        (None, true) => Path::ImplicitCausal,
        (None, false) => Path::Unmasked,
    }
}

impl AttentionBackend for SdpaBackend {
    fn kind(&self) -> AttentionImpl {
        AttentionImpl::ScaledDotProduct
    }

    fn score_and_combine(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
        ctx: &ScoreContext,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let (batch, _heads, query_len, key_len, _) = check_operands(query, key, value, ctx)?;
        let dtype = query.dtype();
        let path = select_path(mask, query_len, ctx.is_causal);
        tracing::trace!(?path, query_len, key_len, "sdpa dispatch");

        let key = repeat_kv(key, ctx.n_rep)?.to_dtype(DType::F32)?;
        let value = repeat_kv(value, ctx.n_rep)?.to_dtype(DType::F32)?;
        let query = (query.to_dtype(DType::F32)? * ctx.scale)?;

        let scores = query.contiguous()?.matmul(&key.t()?.contiguous()?)?;
        let scores = match (path, mask) {
            (Path::Explicit, Some(mask)) => {
                scores.broadcast_add(&slice_mask(mask, batch, query_len, key_len)?)?
            }
            (Path::ImplicitCausal, _) => {
                scores.broadcast_add(&causal_bias(query_len, key_len, 0, key_len, query.device())?)?
            }
            _ => scores,
        };

        let probs = candle_nn::ops::softmax_last_dim(&scores.contiguous()?)?;
        let probs = match ctx.effective_dropout() {
            p if p > 0.0 => candle_nn::ops::dropout(&probs, p)?,
            _ => probs,
        };

        let output = probs.matmul(&value.contiguous()?)?.to_dtype(dtype)?;
        Ok((output, None))
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
    fn path_selection() {
        let mask = Tensor::zeros((1, 1, 1, 1), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(select_path(Some(&mask), 4, true), Path::Explicit);
        assert_eq!(select_path(None, 1, true), Path::Decode);
        assert_eq!(select_path(None, 4, true), Path::ImplicitCausal);
        assert_eq!(select_path(None, 4, false), Path::Unmasked);
    }

    #[test]
    fn implicit_causal_matches_eager() {
        let q = Tensor::randn(0.0f32, 1.0, &[2, 4, 5, 8], &Device::Cpu).unwrap();
        let k = Tensor::randn(0.0f32, 1.0, &[2, 1, 5, 8], &Device::Cpu).unwrap();
        let v = Tensor::randn(0.0f32, 1.0, &[2, 1, 5, 8], &Device::Cpu).unwrap();
        let ctx = ScoreContext::new(8, 4);

        let (expected, _) = EagerBackend.score_and_combine(&q, &k, &v, None, &ctx).unwrap();
        let (actual, _) = SdpaBackend.score_and_combine(&q, &k, &v, None, &ctx).unwrap();
        assert!(max_abs_diff(&expected, &actual) < 1e-5);
    }

    #[test]
    fn decode_sees_every_key() {
        let q = Tensor::randn(0.0f32, 1.0, &[1, 2, 1, 4], &Device::Cpu).unwrap();
        let k = Tensor::randn(0.0f32, 1.0, &[1, 2, 6, 4], &Device::Cpu).unwrap();
        let v = Tensor::randn(0.0f32, 1.0, &[1, 2, 6, 4], &Device::Cpu).unwrap();
        let ctx = ScoreContext::new(4, 1);

        let zero_mask = Tensor::zeros((1, 1, 1, 6), DType::F32, &Device::Cpu).unwrap();
        let (expected, _) = EagerBackend
            .score_and_combine(&q, &k, &v, Some(&zero_mask), &ctx)
            .unwrap();
        let (actual, _) = SdpaBackend.score_and_combine(&q, &k, &v, None, &ctx).unwrap();
        assert!(max_abs_diff(&expected, &actual) < 1e-5);
    }

    #[test]
    fn explicit_mask_matches_eager() {
        let q = Tensor::randn(0.0f32, 1.0, &[2, 2, 3, 4], &Device::Cpu).unwrap();
        let k = Tensor::randn(0.0f32, 1.0, &[2, 2, 3, 4], &Device::Cpu).unwrap();
        let padding = Tensor::new(&[[1u8, 1, 1], [0, 1, 1]], &Device::Cpu).unwrap();
        let mask = crate::mask::AttentionMaskBuilder::new(DType::F32, &Device::Cpu)
            .unwrap()
            .build(Some(&padding), 3, 3, 0, false)
            .unwrap()
            .unwrap();
        let ctx = ScoreContext::new(4, 1);

        let (expected, _) = EagerBackend
            .score_and_combine(&q, &k, &k, Some(&mask), &ctx)
            .unwrap();
        let (actual, _) = SdpaBackend
            .score_and_combine(&q, &k, &k, Some(&mask), &ctx)
            .unwrap();
        assert!(max_abs_diff(&expected, &actual) < 1e-5);
    }
}
