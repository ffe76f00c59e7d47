//! XLM-RoBERTa encoder built from the workspace layer crates.
//!
//! [`XlmRobertaModel`] maps token ids (or precomputed embeddings) to
//! contextual hidden states and an optional pooled first-token vector.
//! Weights come from a [`candle_nn::VarBuilder`] using HuggingFace parameter
//! names, so safetensors checkpoints load directly.

pub mod attention;
pub mod config;
pub mod encoder;
pub mod error;
pub mod layer;
pub mod model;
pub mod pooler;
pub mod pooling;

pub use self::attention::{AttentionBlock, AttentionOutput, SelfAttention};
pub use config::{HiddenAct, PositionEmbeddingType, XlmRobertaConfig};
pub use encoder::{Encoder, EncoderOutput};
pub use error::ModelError;
pub use layer::{EncoderLayer, LayerOutput};
pub use model::{ModelInput, ModelOutput, XlmRobertaModel};
pub use pooler::Pooler;
pub use pooling::mean_pool;
