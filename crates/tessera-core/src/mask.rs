//! Additive attention masks.
//!
//! Masks are bias tensors of shape [batch | 1, 1, query_len, key_len]: 0 where
//! attention is allowed, the most negative finite value of the working dtype
//! where it is forbidden. Masks are absolute: the causal offset of cached
//! tokens is already baked in, so backends only ever slice and add.

use crate::error::{Result, TesseraError};
use candle_core::{DType, Device, Tensor};
use half::{bf16, f16};

/// Most negative finite value of a floating dtype.
pub fn min_value(dtype: DType) -> f64 {
    match dtype {
        DType::F16 => f16::MIN.to_f64(),
        DType::BF16 => bf16::MIN.to_f64(),
        DType::F64 => f64::MIN,
        _ => f32::MIN as f64,
    }
}

/// Builds causal + padding masks for one forward call.
#[derive(Debug, Clone)]
pub struct AttentionMaskBuilder {
    /// Working dtype of the scores the mask is added to.
    dtype: DType,
    /// Device masks are created on.
    device: Device,
}

impl AttentionMaskBuilder {
    /// Create a builder for masks in `dtype`.
    pub fn new(dtype: DType, device: &Device) -> Result<Self> {
        if !dtype.is_float() {
            return Err(TesseraError::Config(format!(
                "attention masks need a floating dtype, got {dtype:?}"
            )));
        }
        Ok(Self {
            dtype,
            device: device.clone(),
        })
    }

    /// Working dtype.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Build the causal mask for `query_len` new tokens attending over
    /// `key_len` key slots, where the new tokens start at absolute position
    /// `cache_offset`.
    ///
    /// `padding_mask` is [batch, mask_len] with 1 = attend and 0 = padding;
    /// `mask_len <= key_len`, missing trailing columns count as attend.
    ///
    /// Returns `None` when `implicit_causal_ok` is set and the backend's own
    /// causal handling gives the same result: no padding, and either a single
    /// query over exactly the filled keys or a cache-free square block.
    pub fn build(
        &self,
        padding_mask: Option<&Tensor>,
        query_len: usize,
        key_len: usize,
        cache_offset: usize,
        implicit_causal_ok: bool,
    ) -> Result<Option<Tensor>> {
        if cache_offset + query_len > key_len {
            return Err(TesseraError::shape(
                "attention mask key length",
                &[cache_offset + query_len],
                &[key_len],
            ));
        }

        let padding = match padding_mask {
            Some(mask) => Some(read_padding(mask, key_len)?),
            None => None,
        };
        let has_padding = padding
            .as_ref()
            .map(|rows| rows.iter().any(|row| row.iter().any(|&v| v == 0.0)))
            .unwrap_or(false);

        let square = cache_offset == 0 && key_len == query_len;
        let single_decode = query_len == 1 && key_len == cache_offset + 1;
        if implicit_causal_ok && !has_padding && (square || single_decode) {
            tracing::trace!(query_len, key_len, "deferring causal mask to backend");
            return Ok(None);
        }

        let min = min_value(self.dtype);
        let batch = padding.as_ref().map(|rows| rows.len()).unwrap_or(1);
        let mut data = vec![0.0f64; batch * query_len * key_len];

        for b in 0..batch {
            for i in 0..query_len {
                let row = &mut data[(b * query_len + i) * key_len..][..key_len];
                for (j, bias) in row.iter_mut().enumerate() {
                    let future = j > cache_offset + i;
                    let padded = padding
                        .as_ref()
                        .and_then(|rows| rows[b].get(j))
                        .map(|&v| v == 0.0)
                        .unwrap_or(false);
                    if future || padded {
                        *bias = min;
                    }
                }
                unmask_unattended(row, min);
            }
        }

        let mask = Tensor::from_vec(data, (batch, 1, query_len, key_len), &self.device)?
            .to_dtype(self.dtype)?;
        Ok(Some(mask))
    }

    /// Non-causal bias for attending over encoder states: [batch, 1, query_len, src_len].
    pub fn expand_padding_mask(&self, padding_mask: &Tensor, query_len: usize) -> Result<Tensor> {
        let (batch, src_len) = padding_mask.dims2()?;
        let rows = read_padding(padding_mask, src_len)?;
        let min = min_value(self.dtype);

        let mut data = Vec::with_capacity(batch * query_len * src_len);
        for row in &rows {
            let mut bias: Vec<f64> = row
                .iter()
                .map(|&v| if v == 0.0 { min } else { 0.0 })
                .collect();
            unmask_unattended(&mut bias, min);
            for _ in 0..query_len {
                data.extend_from_slice(&bias);
            }
        }

        Ok(Tensor::from_vec(data, (batch, 1, query_len, src_len), &self.device)?
            .to_dtype(self.dtype)?)
    }
}

/// Clear a row in which every key is forbidden.
///
/// Fused kernels produce NaNs on rows with no admissible key (left-padded
/// rows at the start of decoding). Such rows belong to padding queries whose
/// output is discarded, so letting them attend everywhere is harmless.
pub fn unmask_unattended(row: &mut [f64], min: f64) -> bool {
    if !row.is_empty() && row.iter().all(|&v| v == min) {
        row.iter_mut().for_each(|v| *v = 0.0);
        return true;
    }
    false
}

fn read_padding(mask: &Tensor, key_len: usize) -> Result<Vec<Vec<f32>>> {
    let (batch, mask_len) = match mask.dims() {
        [batch, len] => (*batch, *len),
        other => {
            return Err(TesseraError::shape("padding mask", &[0, key_len], other));
        }
    };
    if mask_len > key_len {
        return Err(TesseraError::shape(
            "padding mask",
            &[batch, key_len],
            &[batch, mask_len],
        ));
    }
    Ok(mask.to_dtype(DType::F32)?.to_vec2::<f32>()?)
}
