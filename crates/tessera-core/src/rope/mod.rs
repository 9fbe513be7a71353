//! Rotary Position Embeddings (RoPE).
//!
//! RoPE encodes position information by rotating query and key vectors
//! in pairs of dimensions. This allows attention scores to depend on the
//! relative distance between tokens without additive position embeddings.
//!
//! Tables are always built in `f32` and only cast to the working dtype when
//! rows are gathered for a forward call.
//!
//! # Reference
//!
//! [RoFormer: Enhanced Transformer with Rotary Position Embedding](https://arxiv.org/abs/2104.09864)

mod scaling;

pub use scaling::{compute_inv_freq, RopeScaling};

use crate::diagnostics::{Diagnostics, WarningKey};
use crate::error::{check_shape, Result, TesseraError};
use crate::model::AttentionConfig;
use candle_core::{DType, Device, Tensor, D};

/// Precomputed cosine/sine rows for positions `0..len`.
#[derive(Debug, Clone)]
pub struct RotaryTable {
    /// Cosine table: [len, rotary_dim]
    cos: Tensor,
    /// Sine table: [len, rotary_dim]
    sin: Tensor,
    /// Inverse frequencies the table was built from.
    inv_freq: Vec<f32>,
    /// Post-scaling applied to cos/sin (YaRN temperature).
    attention_scaling: f32,
    /// Number of positions covered.
    len: usize,
}

impl RotaryTable {
    /// Build a table covering `len` positions from `inv_freq`.
    pub fn build(
        inv_freq: Vec<f32>,
        attention_scaling: f32,
        len: usize,
        device: &Device,
    ) -> Result<Self> {
        let half_dim = inv_freq.len();
        let freqs = Tensor::from_slice(&inv_freq, (1, half_dim), device)?;

        let positions: Vec<f32> = (0..len).map(|p| p as f32).collect();
        let positions = Tensor::from_vec(positions, (len, 1), device)?;

        // [len, half_dim], duplicated so both halves of a head share an angle.
        let angles = positions.matmul(&freqs)?;
        let emb = Tensor::cat(&[&angles, &angles], 1)?;

        let scale = attention_scaling as f64;
        let cos = (emb.cos()? * scale)?;
        let sin = (emb.sin()? * scale)?;

        Ok(Self {
            cos,
            sin,
            inv_freq,
            attention_scaling,
            len,
        })
    }

    /// Number of positions covered.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the table covers no positions.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inverse frequencies the table was built from.
    pub fn inv_freq(&self) -> &[f32] {
        &self.inv_freq
    }

    /// Scaling multiplied into cos/sin.
    pub fn attention_scaling(&self) -> f32 {
        self.attention_scaling
    }

    /// Cosine table [len, rotary_dim].
    pub fn cos(&self) -> &Tensor {
        &self.cos
    }

    /// Sine table [len, rotary_dim].
    pub fn sin(&self) -> &Tensor {
        &self.sin
    }
}

/// Rotary Position Embedding with an optional scaling policy.
///
/// Under the dynamic policy the table is the one piece of state that spans
/// forward calls; it is replaced through [`RotaryEmbedding::ensure_capacity`].
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    /// Currently installed table.
    table: RotaryTable,
    /// Table built at construction, restored when a dynamic table shrinks back.
    original: RotaryTable,
    /// Scaling policy.
    scaling: RopeScaling,
    /// Rotary base (theta).
    base: f64,
    /// Number of rotated features per head.
    rotary_dim: usize,
    /// Training length of the model.
    original_max_len: usize,
    /// Device tables live on.
    device: Device,
}

impl RotaryEmbedding {
    /// Create a new rotary embedding.
    ///
    /// # Arguments
    ///
    /// * `rotary_dim` - Number of rotated features per head (even)
    /// * `max_seq_len` - Training length; the initial table covers it
    /// * `base` - Base frequency (10000.0 for most models, Llama-3 uses 500000.0)
    /// * `scaling` - Scaling policy
    /// * `device` - Device for tensors
    pub fn new(
        rotary_dim: usize,
        max_seq_len: usize,
        base: f64,
        scaling: RopeScaling,
        device: &Device,
    ) -> Result<Self> {
        if rotary_dim == 0 || rotary_dim % 2 != 0 {
            return Err(TesseraError::Config(format!(
                "rotary dimension must be a positive even number, got {rotary_dim}"
            )));
        }
        scaling.validate().map_err(TesseraError::Config)?;

        let (inv_freq, attention_scaling) =
            compute_inv_freq(rotary_dim, base, &scaling, max_seq_len, max_seq_len);
        let table = RotaryTable::build(inv_freq, attention_scaling, max_seq_len, device)?;

        Ok(Self {
            original: table.clone(),
            table,
            scaling,
            base,
            rotary_dim,
            original_max_len: max_seq_len,
            device: device.clone(),
        })
    }

    /// Create the rotary embedding described by a model config.
    pub fn from_config(config: &AttentionConfig, device: &Device) -> Result<Self> {
        Self::new(
            config.rotary_dim(),
            config.max_position_embeddings,
            config.rope_theta,
            config.rope_scaling.clone().unwrap_or_default(),
            device,
        )
    }

    /// Decide whether serving `requested_max` positions needs a new table.
    ///
    /// Pure: nothing is installed. `current_max` is the length of the table in
    /// use. Returns the replacement table, if any:
    /// - growth past `current_max` rebuilds the table (dynamic policies also
    ///   re-derive their frequencies for the new length);
    /// - a dynamic table stretched past the training length is reset to the
    ///   original one once requests fall back under that length.
    pub fn recompute_if_needed(
        &self,
        current_max: usize,
        requested_max: usize,
    ) -> Result<Option<RotaryTable>> {
        if requested_max > current_max {
            let (inv_freq, attention_scaling) = if self.scaling.is_dynamic() {
                compute_inv_freq(
                    self.rotary_dim,
                    self.base,
                    &self.scaling,
                    requested_max,
                    self.original_max_len,
                )
            } else {
                (
                    self.table.inv_freq.clone(),
                    self.table.attention_scaling,
                )
            };
            let table = RotaryTable::build(inv_freq, attention_scaling, requested_max, &self.device)?;
            return Ok(Some(table));
        }

        if self.scaling.is_dynamic()
            && requested_max < self.original_max_len
            && current_max > self.original_max_len
        {
            return Ok(Some(self.original.clone()));
        }

        Ok(None)
    }

    /// Make sure positions `0..requested_max` are covered, swapping tables
    /// when [`Self::recompute_if_needed`] says so. Returns whether a swap happened.
    pub fn ensure_capacity(
        &mut self,
        requested_max: usize,
        diagnostics: &Diagnostics,
    ) -> Result<bool> {
        match self.recompute_if_needed(self.table.len, requested_max)? {
            Some(table) => {
                tracing::debug!(
                    policy = self.scaling.name(),
                    from = self.table.len,
                    to = table.len,
                    "replacing rotary table"
                );
                if table.len > self.original_max_len && !self.scaling.is_dynamic() {
                    diagnostics.warn_once(
                        WarningKey::RopeTableRegrown,
                        "positions exceed max_position_embeddings; extending the rotary table without rescaling",
                    );
                }
                self.table = table;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Gather cos/sin rows for `positions` ([batch, seq], u32).
    ///
    /// Returns `(cos, sin)` shaped [batch, seq, rotary_dim] in `dtype`. Callers
    /// must have run [`Self::ensure_capacity`] for the largest position.
    pub fn cos_sin(&self, positions: &Tensor, dtype: DType) -> Result<(Tensor, Tensor)> {
        let (batch, seq_len) = positions.dims2()?;
        let ids = positions.to_dtype(DType::U32)?.flatten_all()?;

        let max_pos = max_position(positions)?;
        if max_pos >= self.table.len {
            return Err(TesseraError::shape(
                "rotary positions",
                &[self.table.len],
                &[max_pos + 1],
            ));
        }

        let cos = self
            .table
            .cos
            .index_select(&ids, 0)?
            .reshape((batch, seq_len, self.rotary_dim))?
            .to_dtype(dtype)?;
        let sin = self
            .table
            .sin
            .index_select(&ids, 0)?
            .reshape((batch, seq_len, self.rotary_dim))?
            .to_dtype(dtype)?;
        Ok((cos, sin))
    }

    /// Currently installed table.
    pub fn table(&self) -> &RotaryTable {
        &self.table
    }

    /// Scaling policy.
    pub fn scaling(&self) -> &RopeScaling {
        &self.scaling
    }

    /// Number of rotated features per head.
    pub fn rotary_dim(&self) -> usize {
        self.rotary_dim
    }

    /// Training length.
    pub fn original_max_len(&self) -> usize {
        self.original_max_len
    }
}

/// Largest position id in a [batch, seq] tensor.
pub fn max_position(positions: &Tensor) -> Result<usize> {
    let ids = positions.to_dtype(DType::U32)?.flatten_all()?.to_vec1::<u32>()?;
    Ok(ids.into_iter().max().map(|p| p as usize).unwrap_or(0))
}

/// Rotate half the features: `(x1, x2) -> (-x2, x1)`.
pub fn rotate_half(x: &Tensor) -> Result<Tensor> {
    let last = x.dim(D::Minus1)?;
    let half = last / 2;
    let x1 = x.narrow(D::Minus1, 0, half)?;
    let x2 = x.narrow(D::Minus1, half, last - half)?;
    Ok(Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?)
}

/// Apply the rotation `x * cos + rotate_half(x) * sin` to one tensor.
///
/// `x` is [batch, heads, seq, head_dim]; `cos`/`sin` are [batch, seq, rotary_dim].
/// When `rotary_dim < head_dim` only the leading features rotate.
pub fn apply_rotary(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    rotate_with(x, cos, sin, false)
}

/// Undo [`apply_rotary`] for the same `cos`/`sin`.
pub fn apply_inverse_rotary(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    rotate_with(x, cos, sin, true)
}

/// Apply the rotation to queries and keys with the same angles. Values are
/// never rotated.
pub fn apply_rotary_pos_emb(
    query: &Tensor,
    key: &Tensor,
    cos: &Tensor,
    sin: &Tensor,
) -> Result<(Tensor, Tensor)> {
    let query = apply_rotary(query, cos, sin)?;
    let key = apply_rotary(key, cos, sin)?;
    Ok((query, key))
}

fn rotate_with(x: &Tensor, cos: &Tensor, sin: &Tensor, inverse: bool) -> Result<Tensor> {
    let (batch, _heads, seq_len, head_dim) = x.dims4()?;
    let rotary_dim = cos.dim(D::Minus1)?;
    check_shape("rotary cos", &[batch, seq_len, rotary_dim], cos.dims())?;
    check_shape("rotary sin", &[batch, seq_len, rotary_dim], sin.dims())?;
    if rotary_dim > head_dim {
        return Err(TesseraError::shape("rotary dim", &[head_dim], &[rotary_dim]));
    }

    // [batch, 1, seq, rotary_dim] broadcasts over heads.
    let cos = cos.unsqueeze(1)?;
    let sin = if inverse {
        sin.unsqueeze(1)?.neg()?
    } else {
        sin.unsqueeze(1)?
    };

    let (rot, pass) = if rotary_dim < head_dim {
        (
            x.narrow(D::Minus1, 0, rotary_dim)?,
            Some(x.narrow(D::Minus1, rotary_dim, head_dim - rotary_dim)?),
        )
    } else {
        (x.clone(), None)
    };

    let rotated = (rot.broadcast_mul(&cos)? + rotate_half(&rot)?.broadcast_mul(&sin)?)?;
    match pass {
        Some(pass) => Ok(Tensor::cat(&[&rotated, &pass], D::Minus1)?),
        None => Ok(rotated),
    }
}
