//! Decoder stack: mask construction, rotary bookkeeping and the layer loop.

use super::{AttentionConfig, DecoderLayer, EncoderContext, LayerWeights, Norm, NormPlacement};
use crate::attention::{AttentionImpl, ForwardOptions};
use crate::cache::KvCache;
use crate::diagnostics::Diagnostics;
use crate::error::{check_shape, Result, TesseraError};
use crate::mask::AttentionMaskBuilder;
use crate::rope::{max_position, RotaryEmbedding};
use candle_core::{DType, Device, Tensor};
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Encoder output for encoder-decoder stacks.
#[derive(Debug, Clone, Copy)]
pub struct EncoderInput<'a> {
    /// Encoder hidden states [batch, src_len, hidden_size].
    pub states: &'a Tensor,
    /// Encoder padding mask [batch, src_len], 1 = attend.
    pub padding_mask: Option<&'a Tensor>,
}

/// Inputs of one stack call.
#[derive(Debug, Clone, Copy)]
pub struct StackInput<'a> {
    /// Hidden states of the new tokens [batch, seq_len, hidden_size].
    pub hidden: &'a Tensor,
    /// Padding mask covering the new tokens or the whole sequence so far.
    pub padding_mask: Option<&'a Tensor>,
    /// Position ids [batch, seq_len]; defaults to continuing after the cache.
    pub positions: Option<&'a Tensor>,
    /// Encoder output, for cross-attention layers.
    pub encoder: Option<EncoderInput<'a>>,
}

impl<'a> StackInput<'a> {
    /// Input with only hidden states.
    pub fn new(hidden: &'a Tensor) -> Self {
        Self {
            hidden,
            padding_mask: None,
            positions: None,
            encoder: None,
        }
    }

    /// Set the padding mask.
    pub fn with_padding_mask(mut self, mask: &'a Tensor) -> Self {
        self.padding_mask = Some(mask);
        self
    }

    /// Set explicit position ids.
    pub fn with_positions(mut self, positions: &'a Tensor) -> Self {
        self.positions = Some(positions);
        self
    }

    /// Set encoder output.
    pub fn with_encoder(mut self, encoder: EncoderInput<'a>) -> Self {
        self.encoder = Some(encoder);
        self
    }
}

/// Output switches of one stack call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackOptions {
    /// Collect per-layer attention probabilities.
    pub output_attentions: bool,
    /// Collect the hidden states entering each layer plus the final output.
    pub output_hidden_states: bool,
}

/// Result of one stack call.
#[derive(Debug, Clone)]
pub struct StackOutput {
    /// Final hidden states [batch, seq_len, hidden_size].
    pub hidden: Tensor,
    /// Per-layer self-attention probabilities; `None` for skipped layers.
    pub attentions: Vec<Option<Tensor>>,
    /// Per-layer cross-attention probabilities.
    pub cross_attentions: Vec<Option<Tensor>>,
    /// Hidden states entering each layer, then the final output.
    pub all_hidden_states: Vec<Tensor>,
}

/// Stack of decoder layers sharing one rotary table and one mask per call.
#[derive(Debug)]
pub struct DecoderStack {
    config: AttentionConfig,
    layers: Vec<DecoderLayer>,
    /// Applied after the last layer of pre-norm models.
    final_norm: Option<Norm>,
    /// Grows, and under dynamic scaling shrinks back, between calls.
    rope: Option<RwLock<RotaryEmbedding>>,
    /// Training mode: enables dropout and layerdrop.
    training: bool,
    layerdrop_rng: Mutex<StdRng>,
    dtype: DType,
    device: Device,
    diagnostics: Diagnostics,
}

impl DecoderStack {
    /// Assemble a stack from layers.
    pub fn new(
        config: AttentionConfig,
        layers: Vec<DecoderLayer>,
        final_norm: Option<Norm>,
        dtype: DType,
        device: &Device,
        diagnostics: Diagnostics,
    ) -> Result<Self> {
        config.validate()?;
        if layers.len() != config.num_hidden_layers {
            return Err(TesseraError::Config(format!(
                "expected {} layers, got {}",
                config.num_hidden_layers,
                layers.len()
            )));
        }
        let rope = if config.use_rotary {
            Some(RwLock::new(RotaryEmbedding::from_config(&config, device)?))
        } else {
            None
        };

        tracing::debug!(
            layers = layers.len(),
            backend = %config.attn_implementation,
            placement = ?config.norm_placement,
            "decoder stack ready"
        );

        Ok(Self {
            config,
            layers,
            final_norm,
            rope,
            training: false,
            layerdrop_rng: Mutex::new(StdRng::from_entropy()),
            dtype,
            device: device.clone(),
            diagnostics,
        })
    }

    /// Create a stack with random weights (for testing).
    pub fn random(
        config: AttentionConfig,
        dtype: DType,
        device: &Device,
        diagnostics: Diagnostics,
    ) -> Result<Self> {
        let layers = (0..config.num_hidden_layers)
            .map(|i| {
                let weights = LayerWeights::random(&config, dtype, device)?;
                DecoderLayer::new(&config, i, weights, diagnostics.clone())
            })
            .collect::<Result<Vec<_>>>()?;
        let final_norm = match config.norm_placement {
            NormPlacement::Pre => Some(Norm::ones(
                config.norm_kind,
                config.hidden_size,
                config.norm_eps,
                dtype,
                device,
            )?),
            NormPlacement::Post => None,
        };
        Self::new(config, layers, final_norm, dtype, device, diagnostics)
    }

    /// Reseed the layerdrop sampler.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.layerdrop_rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    /// Switch to training mode.
    pub fn train(&mut self) {
        self.training = true;
    }

    /// Switch to inference mode.
    pub fn eval(&mut self) {
        self.training = false;
    }

    /// Whether the stack is in training mode.
    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Run the new tokens through every layer.
    ///
    /// With a cache, keys/values of the new tokens are appended to it and the
    /// tokens attend over the full history.
    pub fn forward(
        &self,
        input: StackInput<'_>,
        mut cache: Option<&mut KvCache>,
        options: StackOptions,
    ) -> Result<StackOutput> {
        let (batch, seq_len, hidden_size) = input.hidden.dims3()?;
        check_shape(
            "hidden states",
            &[batch, seq_len, self.config.hidden_size],
            &[batch, seq_len, hidden_size],
        )?;

        let past = match cache.as_deref() {
            Some(cache) => {
                self.check_cache(cache)?;
                cache.seq_len()
            }
            None => 0,
        };
        let key_len = match cache.as_deref() {
            Some(cache) => cache.key_len_after(seq_len)?,
            None => seq_len,
        };

        let positions = match input.positions {
            Some(positions) => {
                check_shape("position ids", &[batch, seq_len], positions.dims())?;
                positions.clone()
            }
            None => Tensor::arange(past as u32, (past + seq_len) as u32, &self.device)?
                .unsqueeze(0)?
                .repeat((batch, 1))?,
        };

        // Stored back into the cache only once every layer has run.
        let padding = match cache.as_deref() {
            Some(cache) => cache.padding_history(input.padding_mask, batch, seq_len, &self.device)?,
            None => input.padding_mask.cloned(),
        };

        let builder = AttentionMaskBuilder::new(self.dtype, &self.device)?;
        let implicit_causal = self.config.attn_implementation.supports_implicit_causal();
        let mask = builder.build(padding.as_ref(), seq_len, key_len, past, implicit_causal)?;

        let encoder_mask = match input.encoder.and_then(|e| e.padding_mask) {
            Some(m) => Some(builder.expand_padding_mask(m, seq_len)?),
            None => None,
        };
        let encoder = EncoderContext {
            states: input.encoder.map(|e| e.states),
            mask: encoder_mask.as_ref(),
        };

        let rope_guard = match &self.rope {
            Some(rope) => {
                let requested = max_position(&positions)? + 1;
                let mut table = rope.write();
                table.ensure_capacity(requested, &self.diagnostics)?;
                // Held for the whole pass so concurrent callers cannot swap the table.
                Some(RwLockWriteGuard::downgrade(table))
            }
            None => None,
        };
        let rope = rope_guard.as_deref();

        let layer_options = ForwardOptions {
            training: self.training,
            output_attentions: options.output_attentions,
            cache_position: Some(past),
        };

        let mut hidden = input.hidden.clone();
        let mut attentions = Vec::new();
        let mut cross_attentions = Vec::new();
        let mut all_hidden_states = Vec::new();

        for layer in &self.layers {
            if options.output_hidden_states {
                all_hidden_states.push(hidden.clone());
            }

            if self.drops_layer() {
                tracing::trace!(layer = layer.layer_idx(), "layerdrop: skipping layer");
                if options.output_attentions {
                    attentions.push(None);
                    cross_attentions.push(None);
                }
                continue;
            }

            let out = layer.forward(
                &hidden,
                mask.as_ref(),
                &positions,
                rope,
                cache.as_deref_mut(),
                Some(&encoder),
                &layer_options,
            )?;
            hidden = out.hidden;
            if options.output_attentions {
                attentions.push(out.attn_weights);
                cross_attentions.push(out.cross_attn_weights);
            }
        }

        if let Some(norm) = &self.final_norm {
            hidden = norm.forward(&hidden)?;
        }
        if options.output_hidden_states {
            all_hidden_states.push(hidden.clone());
        }
        if let Some(cache) = cache {
            cache.set_padding_mask(padding);
        }

        Ok(StackOutput {
            hidden,
            attentions,
            cross_attentions,
            all_hidden_states,
        })
    }

    fn drops_layer(&self) -> bool {
        self.training
            && self.config.layerdrop > 0.0
            && self.layerdrop_rng.lock().gen::<f32>() < self.config.layerdrop
    }

    fn check_cache(&self, cache: &KvCache) -> Result<()> {
        self.config.attn_implementation.check_cache(cache.mode())?;
        if cache.num_layers() != self.layers.len() {
            return Err(TesseraError::Config(format!(
                "cache has {} layers but the stack has {}",
                cache.num_layers(),
                self.layers.len()
            )));
        }
        Ok(())
    }

    /// Model configuration.
    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    /// Get number of layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Layers in order.
    pub fn layers(&self) -> &[DecoderLayer] {
        &self.layers
    }

    /// Configured attention backend.
    pub fn implementation(&self) -> AttentionImpl {
        self.config.attn_implementation
    }

    /// Working dtype.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Device of the weights.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Length of the currently installed rotary table.
    pub fn rotary_len(&self) -> Option<usize> {
        self.rope.as_ref().map(|rope| rope.read().table().len())
    }
}
