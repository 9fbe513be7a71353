//! Per-layer key/value storage.

use crate::error::{check_shape, Result, TesseraError};
use candle_core::Tensor;

/// Extra state travelling with a cache write.
#[derive(Debug, Clone, Copy)]
pub struct CacheKwargs<'a> {
    /// Absolute position of the first new token; must equal the slot length.
    pub cache_position: usize,
    /// Rotary cosines used for the new chunk: [batch, new_tokens, rotary_dim].
    pub cos: Option<&'a Tensor>,
    /// Rotary sines used for the new chunk: [batch, new_tokens, rotary_dim].
    pub sin: Option<&'a Tensor>,
}

impl CacheKwargs<'_> {
    /// Kwargs carrying only a position.
    pub fn at(cache_position: usize) -> Self {
        Self {
            cache_position,
            cos: None,
            sin: None,
        }
    }
}

/// Growing key/value history, concatenated along the sequence axis.
#[derive(Debug, Clone, Default)]
pub struct AppendKv {
    /// Cached keys: [batch, num_kv_heads, seq_len, head_dim]
    key: Option<Tensor>,
    /// Cached values: [batch, num_kv_heads, seq_len, head_dim]
    value: Option<Tensor>,
    /// Rotary cosines for every cached position: [batch, seq_len, rotary_dim]
    cos: Option<Tensor>,
    /// Rotary sines for every cached position.
    sin: Option<Tensor>,
}

impl AppendKv {
    /// Current sequence length.
    pub fn len(&self) -> usize {
        self.key.as_ref().map(|k| k.dims()[2]).unwrap_or(0)
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.key.is_none()
    }

    /// Append new KV and return the full history.
    fn append(&mut self, key: &Tensor, value: &Tensor, kwargs: CacheKwargs<'_>) -> Result<(Tensor, Tensor)> {
        let (new_key, new_value) = match (&self.key, &self.value) {
            (Some(cached_k), Some(cached_v)) => {
                let (b, h, _, d) = cached_k.dims4()?;
                let (_, _, new_tokens, _) = key.dims4()?;
                check_shape("cached key chunk", &[b, h, new_tokens, d], key.dims())?;
                check_shape("cached value chunk", key.dims(), value.dims())?;
                // Concatenate along sequence dimension (dim 2)
                (Tensor::cat(&[cached_k, key], 2)?, Tensor::cat(&[cached_v, value], 2)?)
            }
            _ => {
                check_shape("cached value chunk", key.dims(), value.dims())?;
                (key.clone(), value.clone())
            }
        };

        let (cos, sin) = self.rotary_after(key, kwargs)?;
        self.cos = cos;
        self.sin = sin;
        self.key = Some(new_key.clone());
        self.value = Some(new_value.clone());
        Ok((new_key, new_value))
    }

    /// Rotary history after this write. Either every chunk carries cos/sin
    /// rows or none does, so the history always matches the keys.
    fn rotary_after(&self, key: &Tensor, kwargs: CacheKwargs<'_>) -> Result<(Option<Tensor>, Option<Tensor>)> {
        let len = self.len();
        let rotary_len = self.cos.as_ref().map(|c| c.dims()[1]).unwrap_or(0);
        match (kwargs.cos, kwargs.sin) {
            (Some(cos), Some(sin)) => {
                if rotary_len != len {
                    return Err(TesseraError::shape("rotary history", &[len], &[rotary_len]));
                }
                let (batch, _, new_tokens, _) = key.dims4()?;
                let (_, _, dim) = cos.dims3()?;
                check_shape("rotary rows", &[batch, new_tokens, dim], cos.dims())?;
                check_shape("rotary rows", cos.dims(), sin.dims())?;
                Ok((
                    Some(append_rows(self.cos.as_ref(), cos)?),
                    Some(append_rows(self.sin.as_ref(), sin)?),
                ))
            }
            (None, None) => {
                if self.cos.is_some() {
                    return Err(TesseraError::shape("rotary history", &[len + key.dims4()?.2], &[rotary_len]));
                }
                Ok((None, None))
            }
            _ => Err(TesseraError::Config("rotary cos and sin must be given together".to_string())),
        }
    }

    /// Cached KV without modification.
    pub fn get(&self) -> Option<(&Tensor, &Tensor)> {
        match (&self.key, &self.value) {
            (Some(k), Some(v)) => Some((k, v)),
            _ => None,
        }
    }

    /// Rotary cos/sin for every cached position, when writers supplied them.
    pub fn rotary(&self) -> Option<(&Tensor, &Tensor)> {
        match (&self.cos, &self.sin) {
            (Some(c), Some(s)) => Some((c, s)),
            _ => None,
        }
    }
}

fn append_rows(history: Option<&Tensor>, rows: &Tensor) -> Result<Tensor> {
    match history {
        Some(history) => Ok(Tensor::cat(&[history, rows], 1)?),
        None => Ok(rows.clone()),
    }
}

/// Fixed-capacity buffer written in place.
///
/// The buffer is allocated on the first write, taking batch size, head count,
/// dtype and device from that chunk.
#[derive(Debug, Clone)]
pub struct StaticKv {
    /// Key buffer: [batch, num_kv_heads, max_len, head_dim]
    key: Option<Tensor>,
    /// Value buffer: [batch, num_kv_heads, max_len, head_dim]
    value: Option<Tensor>,
    /// Preallocated length.
    max_len: usize,
    /// Number of filled slots.
    len: usize,
}

impl StaticKv {
    /// Empty slot with room for `max_len` positions.
    pub fn new(max_len: usize) -> Self {
        Self {
            key: None,
            value: None,
            max_len,
            len: 0,
        }
    }

    /// Number of filled positions.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing is written yet.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Preallocated length.
    pub fn capacity(&self) -> usize {
        self.max_len
    }

    /// Write new KV at `position` and return the whole buffers.
    fn write(&mut self, key: &Tensor, value: &Tensor, position: usize) -> Result<(Tensor, Tensor)> {
        let (batch, heads, new_tokens, head_dim) = key.dims4()?;
        check_shape("cached value chunk", key.dims(), value.dims())?;
        if position >= self.max_len || position + new_tokens > self.max_len {
            return Err(TesseraError::CacheCapacity {
                position,
                new_tokens,
                capacity: self.max_len,
            });
        }

        let (key_buf, value_buf) = match (&self.key, &self.value) {
            (Some(k), Some(v)) => {
                let (b, h, _, d) = k.dims4()?;
                check_shape("static cache chunk", &[b, h, new_tokens, d], key.dims())?;
                (k.clone(), v.clone())
            }
            _ => {
                let shape = (batch, heads, self.max_len, head_dim);
                (
                    Tensor::zeros(shape, key.dtype(), key.device())?,
                    Tensor::zeros(shape, value.dtype(), value.device())?,
                )
            }
        };

        let key_buf = key_buf.slice_scatter(&key.contiguous()?, 2, position)?;
        let value_buf = value_buf.slice_scatter(&value.contiguous()?, 2, position)?;

        self.key = Some(key_buf.clone());
        self.value = Some(value_buf.clone());
        self.len = position + new_tokens;
        Ok((key_buf, value_buf))
    }

    /// Full buffers, including unfilled slots.
    pub fn get(&self) -> Option<(&Tensor, &Tensor)> {
        match (&self.key, &self.value) {
            (Some(k), Some(v)) => Some((k, v)),
            _ => None,
        }
    }
}

/// Self-attention slot of one layer.
#[derive(Debug, Clone)]
pub enum KvSlot {
    /// Append-mode history.
    Append(AppendKv),
    /// Static preallocated buffer.
    Static(StaticKv),
}

impl KvSlot {
    /// Number of cached positions.
    pub fn len(&self) -> usize {
        match self {
            Self::Append(slot) => slot.len(),
            Self::Static(slot) => slot.len(),
        }
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write a chunk at `kwargs.cache_position` and return the effective K/V.
    pub(crate) fn update(
        &mut self,
        layer: usize,
        key: &Tensor,
        value: &Tensor,
        kwargs: CacheKwargs<'_>,
    ) -> Result<(Tensor, Tensor)> {
        let expected = self.len();
        if kwargs.cache_position != expected {
            return Err(TesseraError::CacheOrder {
                layer,
                expected,
                actual: kwargs.cache_position,
            });
        }
        match self {
            Self::Append(slot) => slot.append(key, value, kwargs),
            Self::Static(slot) => slot.write(key, value, kwargs.cache_position),
        }
    }
}

/// Encoder-side keys/values, computed once per session and reused.
#[derive(Debug, Clone)]
pub struct CrossKv {
    /// Keys: [batch, num_kv_heads, src_len, head_dim]
    pub key: Tensor,
    /// Values: [batch, num_kv_heads, src_len, head_dim]
    pub value: Tensor,
}

/// Everything one layer caches.
#[derive(Debug, Clone)]
pub struct LayerCache {
    /// Self-attention history.
    pub self_attn: KvSlot,
    /// Cross-attention keys/values, for encoder-decoder layers.
    pub cross_attn: Option<CrossKv>,
}
