//! Decoder layers and stacks built on the attention core.
//!
//! Provides:
//! - [`AttentionConfig`] - shapes, rotary settings and backend selection
//! - [`Norm`] / [`FeedForward`] - the non-attention blocks of a layer
//! - [`DecoderLayer`] - self-attention, optional cross-attention and MLP
//! - [`DecoderStack`] - mask construction and the layer loop

mod config;
mod layer;
mod mlp;
mod norm;
mod stack;

pub use config::{AttentionConfig, FeedForwardKind, NormKind, NormPlacement};
pub use layer::{DecoderLayer, EncoderContext, LayerOutput, LayerWeights};
pub use mlp::FeedForward;
pub use norm::{LayerNorm, Norm, RmsNorm};
pub use stack::{DecoderStack, EncoderInput, StackInput, StackOptions, StackOutput};
