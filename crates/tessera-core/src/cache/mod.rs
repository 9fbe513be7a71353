//! Key/value cache for incremental decoding.
//!
//! One [`KvCache`] belongs to one generation session. It holds a
//! [`LayerCache`] per decoder layer plus the session's padding-mask history.
//!
//! Two storage modes:
//!
//! 1. **Append** - history grows by concatenation; returned K/V cover exactly
//!    the cached positions.
//! 2. **Static** - a buffer of `max_len` positions is written in place; returned
//!    K/V always span the full capacity and the mask hides unfilled slots.
//!
//! Writes to a layer must arrive at strictly increasing, contiguous positions.
//!
//! # Example
//!
//! ```rust
//! use tessera_core::cache::{CacheKwargs, CacheMode, KvCache};
//! use candle_core::{DType, Device, Tensor};
//!
//! let mut cache = KvCache::new(2, CacheMode::Append).unwrap();
//! let k = Tensor::zeros((1, 2, 3, 4), DType::F32, &Device::Cpu).unwrap();
//!
//! let (keys, _) = cache.update(0, &k, &k, CacheKwargs::at(0)).unwrap();
//! assert_eq!(keys.dims(), &[1, 2, 3, 4]);
//! assert_eq!(cache.length(0).unwrap(), 3);
//!
//! // Writing layer 0 at position 0 again is rejected.
//! assert!(cache.update(0, &k, &k, CacheKwargs::at(0)).is_err());
//! ```

mod slot;

pub use slot::{AppendKv, CacheKwargs, CrossKv, KvSlot, LayerCache, StaticKv};

use crate::error::{check_shape, Result, TesseraError};
use crate::model::AttentionConfig;
use candle_core::{DType, Device, Tensor};

/// Storage strategy of a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Concatenate along the sequence axis.
    #[default]
    Append,
    /// Preallocate `max_len` positions and write in place.
    Static {
        /// Upper bound on the total sequence length.
        max_len: usize,
    },
}

/// Session cache for all layers.
#[derive(Debug, Clone)]
pub struct KvCache {
    /// Per-layer caches.
    layers: Vec<LayerCache>,
    /// Storage mode shared by all layers.
    mode: CacheMode,
    /// Padding history [batch, seq_len] in f32, 1 = attend.
    padding_mask: Option<Tensor>,
}

impl KvCache {
    /// Create an empty cache for `num_layers` layers.
    pub fn new(num_layers: usize, mode: CacheMode) -> Result<Self> {
        if let CacheMode::Static { max_len: 0 } = mode {
            return Err(TesseraError::Config(
                "a static cache needs a positive max_len".to_string(),
            ));
        }
        let layers = (0..num_layers)
            .map(|_| LayerCache {
                self_attn: match mode {
                    CacheMode::Append => KvSlot::Append(AppendKv::default()),
                    CacheMode::Static { max_len } => KvSlot::Static(StaticKv::new(max_len)),
                },
                cross_attn: None,
            })
            .collect();
        Ok(Self {
            layers,
            mode,
            padding_mask: None,
        })
    }

    /// Create a cache sized for a model config.
    pub fn for_config(config: &AttentionConfig, mode: CacheMode) -> Result<Self> {
        config.attn_implementation.check_cache(mode)?;
        Self::new(config.num_hidden_layers, mode)
    }

    /// Write new keys/values for `layer` and return the K/V to score against.
    ///
    /// # Arguments
    ///
    /// * `layer` - Layer index
    /// * `key` - New keys [batch, num_kv_heads, new_tokens, head_dim]
    /// * `value` - New values, same shape as `key`
    /// * `kwargs` - Write position and rotary rows for the chunk
    pub fn update(
        &mut self,
        layer: usize,
        key: &Tensor,
        value: &Tensor,
        kwargs: CacheKwargs<'_>,
    ) -> Result<(Tensor, Tensor)> {
        let (new_key, new_value) = self
            .layer_mut(layer)?
            .self_attn
            .update(layer, key, value, kwargs)?;
        tracing::trace!(layer, len = self.layers[layer].self_attn.len(), "cache updated");
        Ok((new_key, new_value))
    }

    /// Current cached sequence length of `layer`.
    pub fn length(&self, layer: usize) -> Result<usize> {
        Ok(self.layer(layer)?.self_attn.len())
    }

    /// Current sequence length (from first layer).
    pub fn seq_len(&self) -> usize {
        self.layers.first().map(|l| l.self_attn.len()).unwrap_or(0)
    }

    /// Key length the next call will score against after writing `new_tokens`.
    ///
    /// Static caches always present their full capacity; overflowing it is a
    /// [`TesseraError::CacheCapacity`].
    pub fn key_len_after(&self, new_tokens: usize) -> Result<usize> {
        let position = self.seq_len();
        match self.mode {
            CacheMode::Append => Ok(position + new_tokens),
            CacheMode::Static { max_len } => {
                if position >= max_len || position + new_tokens > max_len {
                    return Err(TesseraError::CacheCapacity {
                        position,
                        new_tokens,
                        capacity: max_len,
                    });
                }
                Ok(max_len)
            }
        }
    }

    /// Extend the padding history by one chunk and return the full history.
    ///
    /// Same as [`Self::padding_history`] followed by [`Self::set_padding_mask`];
    /// on error the stored history is left untouched.
    pub fn extend_padding_mask(
        &mut self,
        chunk: Option<&Tensor>,
        batch: usize,
        new_tokens: usize,
        device: &Device,
    ) -> Result<Option<Tensor>> {
        let history = self.padding_history(chunk, batch, new_tokens, device)?;
        self.set_padding_mask(history.clone());
        Ok(history)
    }

    /// Padding history after one more chunk, without storing it.
    ///
    /// `chunk` may cover only the new tokens ([batch, new_tokens]) or the whole
    /// sequence so far ([batch, seq_len + new_tokens]); a full-width mask
    /// replaces the history, which lets a position change from padding to
    /// content between steps. When only one side has a mask, the other side is
    /// filled with ones.
    pub fn padding_history(
        &self,
        chunk: Option<&Tensor>,
        batch: usize,
        new_tokens: usize,
        device: &Device,
    ) -> Result<Option<Tensor>> {
        let past = self.seq_len();
        if let Some(prev) = &self.padding_mask {
            check_shape("padding history", &[batch, past], prev.dims())?;
        }
        match (&self.padding_mask, chunk) {
            (None, None) => Ok(None),
            (prev, Some(chunk)) => {
                let (b, width) = chunk.dims2()?;
                if b != batch {
                    return Err(TesseraError::shape("padding mask", &[batch, width], chunk.dims()));
                }
                let chunk = chunk.to_dtype(DType::F32)?;
                if width == past + new_tokens {
                    Ok(Some(chunk))
                } else if width == new_tokens {
                    let prev = match prev {
                        Some(prev) => prev.clone(),
                        None => Tensor::ones((batch, past), DType::F32, device)?,
                    };
                    Ok(Some(Tensor::cat(&[&prev, &chunk], 1)?))
                } else {
                    Err(TesseraError::shape(
                        "padding mask",
                        &[batch, past + new_tokens],
                        &[b, width],
                    ))
                }
            }
            (Some(prev), None) => {
                let filler = Tensor::ones((batch, new_tokens), DType::F32, device)?;
                Ok(Some(Tensor::cat(&[prev, &filler], 1)?))
            }
        }
    }

    /// Replace the stored padding history.
    pub fn set_padding_mask(&mut self, history: Option<Tensor>) {
        self.padding_mask = history;
    }

    /// Padding history of the session.
    pub fn padding_mask(&self) -> Option<&Tensor> {
        self.padding_mask.as_ref()
    }

    /// Cached encoder keys/values of `layer`.
    pub fn cross_kv(&self, layer: usize) -> Result<Option<&CrossKv>> {
        Ok(self.layer(layer)?.cross_attn.as_ref())
    }

    /// Store encoder keys/values for `layer`.
    pub fn set_cross_kv(&mut self, layer: usize, key: Tensor, value: Tensor) -> Result<()> {
        self.layer_mut(layer)?.cross_attn = Some(CrossKv { key, value });
        Ok(())
    }

    /// Get reference to layer cache.
    pub fn layer(&self, layer: usize) -> Result<&LayerCache> {
        let num_layers = self.layers.len();
        self.layers
            .get(layer)
            .ok_or(TesseraError::InvalidLayer { layer, num_layers })
    }

    fn layer_mut(&mut self, layer: usize) -> Result<&mut LayerCache> {
        let num_layers = self.layers.len();
        self.layers
            .get_mut(layer)
            .ok_or(TesseraError::InvalidLayer { layer, num_layers })
    }

    /// Preallocated length, for static caches.
    pub fn capacity(&self) -> Option<usize> {
        match self.mode {
            CacheMode::Append => None,
            CacheMode::Static { max_len } => Some(max_len),
        }
    }

    /// Storage mode.
    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    /// Get number of layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Drop every cached tensor, keeping mode and layer count.
    pub fn clear(&mut self) {
        for layer in &mut self.layers {
            layer.self_attn = match self.mode {
                CacheMode::Append => KvSlot::Append(AppendKv::default()),
                CacheMode::Static { max_len } => KvSlot::Static(StaticKv::new(max_len)),
            };
            layer.cross_attn = None;
        }
        self.padding_mask = None;
    }

    /// Check if cache is empty.
    pub fn is_empty(&self) -> bool {
        self.layers.iter().all(|l| l.self_attn.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(tokens: usize, fill: f32) -> Tensor {
        (Tensor::ones((1, 2, tokens, 4), DType::F32, &Device::Cpu).unwrap() * fill as f64).unwrap()
    }

    #[test]
    fn append_grows_history() {
        let mut cache = KvCache::new(2, CacheMode::Append).unwrap();
        assert!(cache.is_empty());

        let (k, v) = cache.update(0, &chunk(4, 1.0), &chunk(4, 2.0), CacheKwargs::at(0)).unwrap();
        assert_eq!(k.dims(), &[1, 2, 4, 4]);
        assert_eq!(v.dims(), &[1, 2, 4, 4]);

        let (k, _) = cache.update(0, &chunk(1, 3.0), &chunk(1, 3.0), CacheKwargs::at(4)).unwrap();
        assert_eq!(k.dims(), &[1, 2, 5, 4]);
        assert_eq!(cache.length(0).unwrap(), 5);
        assert_eq!(cache.length(1).unwrap(), 0);
        assert_eq!(cache.seq_len(), 5);

        let last: Vec<f32> = k.narrow(2, 4, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(last.iter().all(|&x| x == 3.0));
    }

    #[test]
    fn out_of_order_write_rejected() {
        let mut cache = KvCache::new(1, CacheMode::Append).unwrap();
        cache.update(0, &chunk(2, 1.0), &chunk(2, 1.0), CacheKwargs::at(0)).unwrap();

        let err = cache.update(0, &chunk(1, 1.0), &chunk(1, 1.0), CacheKwargs::at(5)).unwrap_err();
        assert!(matches!(
            err,
            TesseraError::CacheOrder { layer: 0, expected: 2, actual: 5 }
        ));
        // Nothing written.
        assert_eq!(cache.length(0).unwrap(), 2);
    }

    #[test]
    fn invalid_layer() {
        let mut cache = KvCache::new(1, CacheMode::Append).unwrap();
        assert!(matches!(cache.length(3), Err(TesseraError::InvalidLayer { layer: 3, num_layers: 1 })));
        assert!(cache.update(1, &chunk(1, 1.0), &chunk(1, 1.0), CacheKwargs::at(0)).is_err());
    }

    #[test]
    fn append_rejects_mismatched_heads() {
        let mut cache = KvCache::new(1, CacheMode::Append).unwrap();
        cache.update(0, &chunk(2, 1.0), &chunk(2, 1.0), CacheKwargs::at(0)).unwrap();
        let wrong = Tensor::zeros((1, 3, 1, 4), DType::F32, &Device::Cpu).unwrap();
        let err = cache.update(0, &wrong, &wrong, CacheKwargs::at(2)).unwrap_err();
        assert!(matches!(err, TesseraError::ShapeMismatch { .. }));
    }

    #[test]
    fn append_keeps_rotary_history() {
        let mut cache = KvCache::new(1, CacheMode::Append).unwrap();
        let cos = Tensor::ones((1, 2, 4), DType::F32, &Device::Cpu).unwrap();
        let sin = Tensor::zeros((1, 2, 4), DType::F32, &Device::Cpu).unwrap();
        let kwargs = CacheKwargs {
            cache_position: 0,
            cos: Some(&cos),
            sin: Some(&sin),
        };
        cache.update(0, &chunk(2, 1.0), &chunk(2, 1.0), kwargs).unwrap();
        let kwargs = CacheKwargs {
            cache_position: 2,
            cos: Some(&cos),
            sin: Some(&sin),
        };
        cache.update(0, &chunk(2, 1.0), &chunk(2, 1.0), kwargs).unwrap();

        match &cache.layer(0).unwrap().self_attn {
            KvSlot::Append(slot) => {
                let (cos, _) = slot.rotary().unwrap();
                assert_eq!(cos.dims(), &[1, 4, 4]);
            }
            KvSlot::Static(_) => panic!("expected append slot"),
        }
    }

    #[test]
    fn static_writes_in_place() {
        let mut cache = KvCache::new(1, CacheMode::Static { max_len: 6 }).unwrap();
        let (k, _) = cache.update(0, &chunk(2, 1.0), &chunk(2, 1.0), CacheKwargs::at(0)).unwrap();
        assert_eq!(k.dims(), &[1, 2, 6, 4]);

        let (k, _) = cache.update(0, &chunk(1, 5.0), &chunk(1, 5.0), CacheKwargs::at(2)).unwrap();
        assert_eq!(k.dims(), &[1, 2, 6, 4]);
        assert_eq!(cache.length(0).unwrap(), 3);

        let column = |i: usize| -> Vec<f32> {
            k.narrow(2, i, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap()
        };
        assert!(column(1).iter().all(|&x| x == 1.0));
        assert!(column(2).iter().all(|&x| x == 5.0));
        assert!(column(3).iter().all(|&x| x == 0.0));
    }

    #[test]
    fn static_capacity_enforced() {
        let mut cache = KvCache::new(1, CacheMode::Static { max_len: 4 }).unwrap();
        cache.update(0, &chunk(4, 1.0), &chunk(4, 1.0), CacheKwargs::at(0)).unwrap();

        let err = cache.update(0, &chunk(1, 1.0), &chunk(1, 1.0), CacheKwargs::at(4)).unwrap_err();
        assert!(matches!(
            err,
            TesseraError::CacheCapacity { position: 4, new_tokens: 1, capacity: 4 }
        ));
        assert!(matches!(cache.key_len_after(1), Err(TesseraError::CacheCapacity { .. })));
    }

    #[test]
    fn static_chunk_overflow_enforced() {
        let mut cache = KvCache::new(1, CacheMode::Static { max_len: 4 }).unwrap();
        cache.update(0, &chunk(3, 1.0), &chunk(3, 1.0), CacheKwargs::at(0)).unwrap();
        assert!(cache.update(0, &chunk(2, 1.0), &chunk(2, 1.0), CacheKwargs::at(3)).is_err());
        assert_eq!(cache.key_len_after(1).unwrap(), 4);
    }

    #[test]
    fn zero_capacity_rejected() {
        assert!(matches!(
            KvCache::new(1, CacheMode::Static { max_len: 0 }),
            Err(TesseraError::Config(_))
        ));
    }

    #[test]
    fn padding_history_filler_rules() {
        let mut cache = KvCache::new(1, CacheMode::Append).unwrap();
        let device = Device::Cpu;

        // No mask at all.
        assert!(cache.extend_padding_mask(None, 2, 3, &device).unwrap().is_none());
        cache.update(0, &chunk(3, 1.0), &chunk(3, 1.0), CacheKwargs::at(0)).unwrap();

        // Mask only for the new chunk: past filled with ones.
        let step = Tensor::new(&[[0f32], [1.0]], &device).unwrap();
        let history = cache.extend_padding_mask(Some(&step), 2, 1, &device).unwrap().unwrap();
        let rows: Vec<Vec<f32>> = history.to_vec2().unwrap();
        assert_eq!(rows[0], vec![1.0, 1.0, 1.0, 0.0]);
        cache.update(0, &chunk(1, 1.0), &chunk(1, 1.0), CacheKwargs::at(3)).unwrap();

        // No mask for the next chunk: new positions filled with ones.
        let history = cache.extend_padding_mask(None, 2, 1, &device).unwrap().unwrap();
        assert_eq!(history.dims(), &[2, 5]);
        cache.update(0, &chunk(1, 1.0), &chunk(1, 1.0), CacheKwargs::at(4)).unwrap();

        // Full-width mask replaces history.
        let full = Tensor::ones((2, 6), DType::U8, &device).unwrap();
        let history = cache.extend_padding_mask(Some(&full), 2, 1, &device).unwrap().unwrap();
        let rows: Vec<Vec<f32>> = history.to_vec2().unwrap();
        assert_eq!(rows[0], vec![1.0; 6]);
        assert_eq!(cache.padding_mask().unwrap().dims(), &[2, 6]);
    }

    #[test]
    fn padding_history_wrong_width() {
        let mut cache = KvCache::new(1, CacheMode::Append).unwrap();
        let mask = Tensor::ones((1, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(cache.extend_padding_mask(Some(&mask), 1, 2, &Device::Cpu).is_err());
    }

    #[test]
    fn failed_extend_keeps_history() {
        let mut cache = KvCache::new(1, CacheMode::Append).unwrap();
        let device = Device::Cpu;
        let prefix = Tensor::new(&[[0f32, 1.0, 1.0]], &device).unwrap();
        cache.extend_padding_mask(Some(&prefix), 1, 3, &device).unwrap();
        cache.update(0, &chunk(3, 1.0), &chunk(3, 1.0), CacheKwargs::at(0)).unwrap();

        let wrong_width = Tensor::ones((1, 2), DType::F32, &device).unwrap();
        assert!(cache.extend_padding_mask(Some(&wrong_width), 1, 1, &device).is_err());
        let wrong_batch = Tensor::ones((2, 1), DType::F32, &device).unwrap();
        assert!(cache.extend_padding_mask(Some(&wrong_batch), 1, 1, &device).is_err());
        let kept: Vec<Vec<f32>> = cache.padding_mask().unwrap().to_vec2().unwrap();
        assert_eq!(kept, vec![vec![0.0, 1.0, 1.0]]);

        let history = cache.extend_padding_mask(None, 1, 1, &device).unwrap().unwrap();
        let rows: Vec<Vec<f32>> = history.to_vec2().unwrap();
        assert_eq!(rows, vec![vec![0.0, 1.0, 1.0, 1.0]]);
    }

    #[test]
    fn padding_history_is_not_stored() {
        let cache = KvCache::new(1, CacheMode::Append).unwrap();
        let mask = Tensor::new(&[[0f32, 1.0]], &Device::Cpu).unwrap();
        let history = cache.padding_history(Some(&mask), 1, 2, &Device::Cpu).unwrap();
        assert_eq!(history.unwrap().dims(), &[1, 2]);
        assert!(cache.padding_mask().is_none());
    }

    #[test]
    fn append_rotary_must_be_consistent() {
        let mut cache = KvCache::new(1, CacheMode::Append).unwrap();
        let cos = Tensor::ones((1, 2, 4), DType::F32, &Device::Cpu).unwrap();
        let with_rotary = CacheKwargs {
            cache_position: 0,
            cos: Some(&cos),
            sin: Some(&cos),
        };
        cache.update(0, &chunk(2, 1.0), &chunk(2, 1.0), with_rotary).unwrap();

        let err = cache.update(0, &chunk(1, 1.0), &chunk(1, 1.0), CacheKwargs::at(2)).unwrap_err();
        assert!(matches!(err, TesseraError::ShapeMismatch { what: "rotary history", .. }));
        assert_eq!(cache.length(0).unwrap(), 2);

        // Rotary rows must cover exactly the new tokens.
        let with_rotary = CacheKwargs {
            cache_position: 2,
            cos: Some(&cos),
            sin: Some(&cos),
        };
        assert!(cache.update(0, &chunk(1, 1.0), &chunk(1, 1.0), with_rotary).is_err());
        assert_eq!(cache.length(0).unwrap(), 2);
    }

    #[test]
    fn rotary_cannot_start_midway() {
        let mut cache = KvCache::new(1, CacheMode::Append).unwrap();
        cache.update(0, &chunk(2, 1.0), &chunk(2, 1.0), CacheKwargs::at(0)).unwrap();
        let cos = Tensor::ones((1, 1, 4), DType::F32, &Device::Cpu).unwrap();
        let kwargs = CacheKwargs {
            cache_position: 2,
            cos: Some(&cos),
            sin: Some(&cos),
        };
        assert!(cache.update(0, &chunk(1, 1.0), &chunk(1, 1.0), kwargs).is_err());
    }

    #[test]
    fn static_write_at_capacity_rejected() {
        let mut cache = KvCache::new(1, CacheMode::Static { max_len: 2 }).unwrap();
        cache.update(0, &chunk(2, 1.0), &chunk(2, 1.0), CacheKwargs::at(0)).unwrap();
        let err = cache.update(0, &chunk(0, 1.0), &chunk(0, 1.0), CacheKwargs::at(2)).unwrap_err();
        assert!(matches!(
            err,
            TesseraError::CacheCapacity { position: 2, new_tokens: 0, capacity: 2 }
        ));
        assert!(matches!(cache.key_len_after(0), Err(TesseraError::CacheCapacity { .. })));
    }

    #[test]
    fn cross_kv_round_trip_and_clear() {
        let mut cache = KvCache::new(2, CacheMode::Append).unwrap();
        assert!(cache.cross_kv(1).unwrap().is_none());
        cache.set_cross_kv(1, chunk(7, 1.0), chunk(7, 2.0)).unwrap();
        assert_eq!(cache.cross_kv(1).unwrap().unwrap().key.dims(), &[1, 2, 7, 4]);

        cache.update(0, &chunk(1, 1.0), &chunk(1, 1.0), CacheKwargs::at(0)).unwrap();
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.cross_kv(1).unwrap().is_none());
        assert_eq!(cache.mode(), CacheMode::Append);
        assert_eq!(cache.num_layers(), 2);
    }

    #[test]
    fn for_config_checks_backend() {
        let config = AttentionConfig {
            attn_implementation: crate::attention::AttentionImpl::Fused,
            ..AttentionConfig::tiny(8, 2, 2)
        };
        assert!(KvCache::for_config(&config, CacheMode::Static { max_len: 8 }).is_err());
        let cache = KvCache::for_config(&config, CacheMode::Append).unwrap();
        assert_eq!(cache.num_layers(), 2);
        assert_eq!(cache.capacity(), None);
    }
}
