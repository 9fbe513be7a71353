//! Multi-head attention and its scoring backends.
//!
//! Provides:
//! - [`MultiHeadAttention`] - projections, rotary encoding, cache update and output
//! - [`EagerBackend`] - explicit softmax, returns attention weights
//! - [`FusedBackend`] - tiled online softmax (flash-attention on CUDA)
//! - [`SdpaBackend`] - scaled-dot-product dispatch with an implicit-causal fast path
//!
//! The backend is fixed at construction through [`AttentionImpl`]; all three
//! agree up to floating-point rounding.

mod backend;
mod eager;
mod fused;
mod multi_head;
mod sdpa;

pub use backend::{repeat_kv, AttentionBackend, AttentionImpl, ScoreContext};
pub use eager::EagerBackend;
pub use fused::{FusedBackend, DEFAULT_TILE};
pub use multi_head::{AttentionProjections, ForwardOptions, MultiHeadAttention};
pub(crate) use multi_head::random_linear;
pub use sdpa::SdpaBackend;
