//! # Tessera Core
//!
//! Attention engine for autoregressive transformer decoders.
//!
//! This crate provides:
//! - **Rotary position encoding** with default, linear, dynamic-NTK, YaRN and
//!   Llama-3 frequency scaling
//! - **Attention masks** merging causality, cache offset and padding
//! - **Key/value caches** that grow by concatenation or write into a fixed
//!   preallocated buffer
//! - **Multi-head attention** with grouped-query sharing and three
//!   interchangeable scoring backends (eager, fused, scaled-dot-product)
//! - **Decoder layers and stacks** with pre/post norm, optional
//!   cross-attention and layerdrop
//!
//! ```no_run
//! use candle_core::{DType, Device, Tensor};
//! use tessera_core::prelude::*;
//!
//! # fn main() -> tessera_core::Result<()> {
//! let config = AttentionConfig::tiny(64, 8, 2);
//! let stack = DecoderStack::random(config, DType::F32, &Device::Cpu, Diagnostics::tracing())?;
//! let mut cache = KvCache::new(stack.num_layers(), CacheMode::Append)?;
//!
//! let prompt = Tensor::randn(0f32, 1.0, (1, 5, 64), &Device::Cpu)?;
//! stack.forward(StackInput::new(&prompt), Some(&mut cache), StackOptions::default())?;
//!
//! let next = Tensor::randn(0f32, 1.0, (1, 1, 64), &Device::Cpu)?;
//! let out = stack.forward(StackInput::new(&next), Some(&mut cache), StackOptions::default())?;
//! assert_eq!(out.hidden.dims(), &[1, 1, 64]);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod attention;
pub mod cache;
pub mod diagnostics;
pub mod error;
pub mod mask;
pub mod model;
pub mod rope;

pub use error::{Result, TesseraError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::attention::{AttentionBackend, AttentionImpl, ForwardOptions, MultiHeadAttention};
    pub use crate::cache::{CacheMode, KvCache};
    pub use crate::diagnostics::Diagnostics;
    pub use crate::error::{Result, TesseraError};
    pub use crate::mask::AttentionMaskBuilder;
    pub use crate::model::{
        AttentionConfig, DecoderLayer, DecoderStack, EncoderInput, StackInput, StackOptions, StackOutput,
    };
    pub use crate::rope::{RopeScaling, RotaryEmbedding};
}
