//! Error types for Tessera Core.

use thiserror::Error;

/// Result type alias for Tessera operations.
pub type Result<T> = std::result::Result<T, TesseraError>;

/// Errors that can occur in Tessera operations.
///
/// None of these are recovered locally: configuration and shape errors point at an
/// integration mistake and are propagated to the caller as-is.
#[derive(Error, Debug)]
pub enum TesseraError {
    /// Invalid or incompatible configuration, detected at construction.
    #[error("configuration error: {0}")]
    Config(String),

    /// A tensor did not have the shape an invariant requires.
    #[error("shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Which tensor was checked.
        what: &'static str,
        /// Expected dimensions.
        expected: Vec<usize>,
        /// Actual dimensions.
        actual: Vec<usize>,
    },

    /// A static cache write would run past its preallocated length.
    #[error(
        "static cache capacity exceeded: writing {new_tokens} token(s) at position {position} \
         with capacity {capacity}"
    )]
    CacheCapacity {
        /// Offset the write was requested at.
        position: usize,
        /// Number of tokens in the write.
        new_tokens: usize,
        /// Fixed capacity of the cache.
        capacity: usize,
    },

    /// A cache update arrived at an unexpected position.
    #[error("out-of-order cache update for layer {layer}: expected position {expected}, got {actual}")]
    CacheOrder {
        /// Layer the update targeted.
        layer: usize,
        /// Next position the layer expects.
        expected: usize,
        /// Position carried by the update.
        actual: usize,
    },

    /// Layer index outside the cache.
    #[error("invalid layer index {layer} (cache has {num_layers} layers)")]
    InvalidLayer {
        /// Requested layer.
        layer: usize,
        /// Layers held by the cache.
        num_layers: usize,
    },

    /// I/O error.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}

impl TesseraError {
    /// Build a [`TesseraError::ShapeMismatch`] from two dimension slices.
    pub fn shape(what: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            what,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

/// Fail with [`TesseraError::ShapeMismatch`] unless `actual == expected`.
pub(crate) fn check_shape(what: &'static str, expected: &[usize], actual: &[usize]) -> Result<()> {
    if expected != actual {
        return Err(TesseraError::shape(what, expected, actual));
    }
    Ok(())
}
