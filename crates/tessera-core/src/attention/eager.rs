//! Reference attention: explicit matmul, f32 softmax, matmul.

use super::backend::{causal_bias, check_operands, repeat_kv, slice_mask};
use super::{AttentionBackend, AttentionImpl, ScoreContext};
use crate::error::Result;
use candle_core::{DType, Tensor, D};

/// Eager attention backend.
///
/// Materializes the full [batch, heads, q_len, k_len] probability matrix, which
/// makes it the slowest backend and the only one that can hand the weights
/// back to the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct EagerBackend;

impl AttentionBackend for EagerBackend {
    fn kind(&self) -> AttentionImpl {
        AttentionImpl::Eager
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

        let key = repeat_kv(key, ctx.n_rep)?;
        let value = repeat_kv(value, ctx.n_rep)?;

        // Q @ K^T -> [batch, heads, q_len, k_len]
        let scores = query.contiguous()?.matmul(&key.t()?.contiguous()?)?;
        let mut scores = (scores.to_dtype(DType::F32)? * ctx.scale)?;

        if let Some(mask) = mask {
            let mask = slice_mask(mask, batch, query_len, key_len)?;
            scores = scores.broadcast_add(&mask)?;
        } else if ctx.is_causal && query_len > 1 {
            let bias = causal_bias(query_len, key_len, 0, key_len, query.device())?;
            scores = scores.broadcast_add(&bias)?;
        }

        // Softmax in f32, then back to the working dtype.
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?.to_dtype(dtype)?;
        let dropped = match ctx.effective_dropout() {
            p if p > 0.0 => candle_nn::ops::dropout(&probs, p)?,
            _ => probs,
        };

        let output = dropped.matmul(&value.contiguous()?)?;
        let weights = ctx.output_attentions.then_some(dropped);
        Ok((output, weights))
    }
}
