//! # Tessera
//!
//! Incremental decoding on top of the tessera attention engine.
//!
//! A [`DecoderStack`](tessera_core::model::DecoderStack) is shared read-only
//! between sessions; each [`Session`] owns the key/value cache of one
//! generation and drives it through prefill and decode steps.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tessera::prelude::*;
//! use tessera::candle_core::{DType, Device, Tensor};
//!
//! # fn main() -> tessera::Result<()> {
//! let config = AttentionConfig::tiny(64, 8, 2);
//! let stack = Arc::new(DecoderStack::random(config, DType::F32, &Device::Cpu, Diagnostics::tracing())?);
//!
//! let mut session = Session::builder(stack)
//!     .cache_mode(CacheMode::Static { max_len: 32 })
//!     .build()?;
//!
//! session.prefill(&Tensor::randn(0f32, 1.0, (1, 4, 64), &Device::Cpu)?, None)?;
//! let out = session.step(&Tensor::randn(0f32, 1.0, (1, 1, 64), &Device::Cpu)?)?;
//! assert_eq!(session.position(), 5);
//! # let _ = out;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Re-export core crate
pub use tessera_core::*;

pub use candle_core;

mod session;

pub use session::{Session, SessionBuilder};

/// Commonly used types.
pub mod prelude {
    pub use crate::session::{Session, SessionBuilder};
    pub use tessera_core::prelude::*;

    // Re-export useful external types
    pub use tracing;
}
