//! Error types emitted by the embedding layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// An id fell outside the table it indexes.
    #[error("{table}: index {index} out of range for table of size {size}")]
    IndexOutOfRange {
        table: String,
        index: i64,
        size: usize,
    },
    /// A tensor rank or dimension disagrees with the configuration.
    #[error("shape mismatch: {context}")]
    ShapeMismatch { context: String },
    /// The combination of inputs is not usable.
    #[error("invalid input: {context}")]
    InvalidInput { context: String },
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

impl EmbeddingError {
    pub(crate) fn shape(context: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
        }
    }
}
