//! Error taxonomy surfaced by the model crate.

use attention::AttentionError;
use embedding::EmbeddingError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    /// A tensor rank or dimension is inconsistent with the configuration.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    /// A token, token-type or position id lies outside its embedding table.
    #[error("{table}: index {index} out of range for table of size {size}")]
    IndexOutOfRange {
        table: String,
        index: i64,
        size: usize,
    },
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Attention(AttentionError),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

impl From<EmbeddingError> for ModelError {
    fn from(err: EmbeddingError) -> Self {
        match err {
            EmbeddingError::IndexOutOfRange { table, index, size } => {
                Self::IndexOutOfRange { table, index, size }
            }
            EmbeddingError::ShapeMismatch { context } => Self::ShapeMismatch(context),
            EmbeddingError::InvalidInput { context } => Self::InvalidInput(context),
            EmbeddingError::Candle(err) => Self::Candle(err),
        }
    }
}

impl From<AttentionError> for ModelError {
    fn from(err: AttentionError) -> Self {
        match err {
            AttentionError::InvalidShape { context } => Self::ShapeMismatch(context),
            AttentionError::Backend(err) => Self::Candle(err),
            other => Self::Attention(other),
        }
    }
}
