//! Generation sessions: one cache driven through prefill and decode steps.

use candle_core::Tensor;
use std::sync::Arc;
use tessera_core::{
    cache::{CacheMode, KvCache},
    model::{DecoderStack, EncoderInput, StackInput, StackOptions, StackOutput},
    Result, TesseraError,
};

/// Builder for creating a [`Session`].
#[derive(Debug)]
pub struct SessionBuilder {
    stack: Arc<DecoderStack>,
    cache_mode: CacheMode,
    max_len: Option<usize>,
    output_attentions: bool,
    output_hidden_states: bool,
    encoder_states: Option<Tensor>,
    encoder_mask: Option<Tensor>,
}

impl SessionBuilder {
    /// Create a new session builder over a shared stack.
    pub fn new(stack: Arc<DecoderStack>) -> Self {
        Self {
            stack,
            cache_mode: CacheMode::Append,
            max_len: None,
            output_attentions: false,
            output_hidden_states: false,
            encoder_states: None,
            encoder_mask: None,
        }
    }

    /// Set the cache storage mode.
    pub fn cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache_mode = mode;
        self
    }

    /// Cap the total number of positions the session may hold.
    pub fn max_len(mut self, len: usize) -> Self {
        self.max_len = Some(len);
        self
    }

    /// Return per-layer attention probabilities from every call.
    pub fn output_attentions(mut self, enabled: bool) -> Self {
        self.output_attentions = enabled;
        self
    }

    /// Return per-layer hidden states from every call.
    pub fn output_hidden_states(mut self, enabled: bool) -> Self {
        self.output_hidden_states = enabled;
        self
    }

    /// Attach encoder output for cross-attention layers.
    pub fn encoder_states(mut self, states: Tensor, padding_mask: Option<Tensor>) -> Self {
        self.encoder_states = Some(states);
        self.encoder_mask = padding_mask;
        self
    }

    /// Build the session.
    pub fn build(self) -> Result<Session> {
        let config = self.stack.config();
        let cache = KvCache::for_config(config, self.cache_mode)?;

        if let (Some(max_len), Some(capacity)) = (self.max_len, cache.capacity()) {
            if max_len > capacity {
                return Err(TesseraError::Config(format!(
                    "session max_len {max_len} exceeds static cache capacity {capacity}"
                )));
            }
        }
        if config.add_cross_attention != self.encoder_states.is_some() {
            return Err(TesseraError::Config(format!(
                "add_cross_attention is {} but encoder states were {}",
                config.add_cross_attention,
                if self.encoder_states.is_some() { "supplied" } else { "not supplied" }
            )));
        }

        tracing::debug!(
            mode = ?self.cache_mode,
            max_len = ?self.max_len,
            backend = %self.stack.implementation(),
            "session created"
        );

        Ok(Session {
            stack: self.stack,
            cache,
            max_len: self.max_len,
            options: StackOptions {
                output_attentions: self.output_attentions,
                output_hidden_states: self.output_hidden_states,
            },
            encoder_states: self.encoder_states,
            encoder_mask: self.encoder_mask,
        })
    }
}

/// One autoregressive generation: a shared stack plus a cache owned by the
/// session.
#[derive(Debug)]
pub struct Session {
    stack: Arc<DecoderStack>,
    cache: KvCache,
    max_len: Option<usize>,
    options: StackOptions,
    encoder_states: Option<Tensor>,
    encoder_mask: Option<Tensor>,
}

impl Session {
    /// Create a session builder.
    pub fn builder(stack: Arc<DecoderStack>) -> SessionBuilder {
        SessionBuilder::new(stack)
    }

    /// Run the prompt (or a further prompt chunk) through the stack.
    ///
    /// # Arguments
    ///
    /// * `hidden` - Prompt hidden states [batch, seq, hidden_size]
    /// * `padding_mask` - Optional [batch, seq] mask, 1 = attend
    pub fn prefill(&mut self, hidden: &Tensor, padding_mask: Option<&Tensor>) -> Result<StackOutput> {
        let mut input = StackInput::new(hidden);
        input.padding_mask = padding_mask;
        self.forward(input)
    }

    /// Decode one token per sequence.
    pub fn step(&mut self, hidden: &Tensor) -> Result<StackOutput> {
        let (batch, seq_len, hidden_size) = hidden.dims3()?;
        if seq_len != 1 {
            return Err(TesseraError::shape(
                "decode step",
                &[batch, 1, hidden_size],
                hidden.dims(),
            ));
        }
        self.forward(StackInput::new(hidden))
    }

    /// Run an arbitrary input against the session cache.
    ///
    /// Encoder states given to the builder are attached when the input has none.
    pub fn forward(&mut self, input: StackInput<'_>) -> Result<StackOutput> {
        let new_tokens = input.hidden.dim(1)?;
        if let Some(max_len) = self.max_len {
            let position = self.position();
            if position + new_tokens > max_len {
                return Err(TesseraError::CacheCapacity {
                    position,
                    new_tokens,
                    capacity: max_len,
                });
            }
        }

        let encoder = match input.encoder {
            Some(encoder) => Some(encoder),
            None => self.encoder_states.as_ref().map(|states| EncoderInput {
                states,
                padding_mask: self.encoder_mask.as_ref(),
            }),
        };
        let input = StackInput {
            hidden: input.hidden,
            padding_mask: input.padding_mask,
            positions: input.positions,
            encoder,
        };

        let out = self.stack.forward(input, Some(&mut self.cache), self.options)?;
        tracing::trace!(position = self.position(), "session advanced");
        Ok(out)
    }

    /// Number of positions already in the cache.
    pub fn position(&self) -> usize {
        self.cache.seq_len()
    }

    /// Drop all cached state; the next call starts a new sequence.
    pub fn reset(&mut self) {
        self.cache.clear();
    }

    /// Cache owned by this session.
    pub fn cache(&self) -> &KvCache {
        &self.cache
    }

    /// Shared decoder stack.
    pub fn stack(&self) -> &Arc<DecoderStack> {
        &self.stack
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use tessera_core::attention::AttentionImpl;
    use tessera_core::diagnostics::Diagnostics;
    use tessera_core::model::AttentionConfig;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn stack(implementation: AttentionImpl) -> Arc<DecoderStack> {
        init_tracing();
        let config = AttentionConfig {
            attn_implementation: implementation,
            ..AttentionConfig::tiny(8, 2, 1)
        };
        Arc::new(DecoderStack::random(config, DType::F32, &Device::Cpu, Diagnostics::memory()).unwrap())
    }

    #[test]
    fn tracing_diagnostics_drive_a_session() {
        init_tracing();
        let config = AttentionConfig {
            attn_implementation: AttentionImpl::ScaledDotProduct,
            ..AttentionConfig::tiny(8, 2, 1)
        };
        let stack = DecoderStack::random(config, DType::F32, &Device::Cpu, Diagnostics::tracing()).unwrap();
        let mut session = Session::builder(Arc::new(stack)).output_attentions(true).build().unwrap();

        // Weights force the eager fallback, reported through tracing.
        let out = session.prefill(&hidden(2), None).unwrap();
        assert!(out.attentions.iter().all(|a| a.is_some()));
        let out = session.step(&hidden(1)).unwrap();
        assert_eq!(out.attentions[0].as_ref().unwrap().dims(), &[1, 2, 1, 3]);
    }

    fn hidden(seq: usize) -> Tensor {
        Tensor::randn(0.0f32, 1.0, &[1, seq, 8], &Device::Cpu).unwrap()
    }

    #[test]
    fn prefill_then_steps_advance_position() {
        let mut session = Session::builder(stack(AttentionImpl::ScaledDotProduct)).build().unwrap();
        assert_eq!(session.position(), 0);

        session.prefill(&hidden(3), None).unwrap();
        assert_eq!(session.position(), 3);

        let out = session.step(&hidden(1)).unwrap();
        assert_eq!(out.hidden.dims(), &[1, 1, 8]);
        assert_eq!(session.position(), 4);

        session.reset();
        assert_eq!(session.position(), 0);
        assert!(session.cache().is_empty());
    }

    #[test]
    fn step_rejects_multiple_tokens() {
        let mut session = Session::builder(stack(AttentionImpl::Eager)).build().unwrap();
        let err = session.step(&hidden(2)).unwrap_err();
        assert!(matches!(err, TesseraError::ShapeMismatch { .. }));
    }

    #[test]
    fn fused_static_rejected_at_build() {
        let err = Session::builder(stack(AttentionImpl::Fused))
            .cache_mode(CacheMode::Static { max_len: 16 })
            .build()
            .unwrap_err();
        assert!(matches!(err, TesseraError::Config(_)));
    }

    #[test]
    fn max_len_limits_session() {
        let mut session = Session::builder(stack(AttentionImpl::Eager))
            .max_len(4)
            .build()
            .unwrap();
        session.prefill(&hidden(4), None).unwrap();
        let err = session.step(&hidden(1)).unwrap_err();
        assert!(matches!(err, TesseraError::CacheCapacity { position: 4, .. }));
    }

    #[test]
    fn max_len_cannot_exceed_static_capacity() {
        let result = Session::builder(stack(AttentionImpl::Eager))
            .cache_mode(CacheMode::Static { max_len: 4 })
            .max_len(8)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn sessions_share_one_stack() {
        let stack = stack(AttentionImpl::Eager);
        let mut a = Session::builder(stack.clone())
            .cache_mode(CacheMode::Static { max_len: 8 })
            .build()
            .unwrap();
        let mut b = Session::builder(stack.clone()).build().unwrap();

        let prompt = hidden(3);
        let out_a = a.prefill(&prompt, None).unwrap();
        let out_b = b.prefill(&prompt, None).unwrap();
        let diff: f32 = (out_a.hidden - out_b.hidden)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-5);
        assert_eq!(Arc::strong_count(&stack), 3);
    }

    #[test]
    fn attentions_returned_when_requested() {
        let mut session = Session::builder(stack(AttentionImpl::Eager))
            .output_attentions(true)
            .build()
            .unwrap();
        let out = session.prefill(&hidden(2), None).unwrap();
        assert_eq!(out.attentions.len(), 2);
        assert_eq!(out.attentions[0].as_ref().unwrap().dims(), &[1, 2, 2, 2]);
    }
}
